// trackcast-common: shared types and wire formats for the trackcast workspace

pub mod keyspace;
pub mod location;
pub mod records;
