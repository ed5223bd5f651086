pub mod booking_token;
pub mod identity;
pub mod middleware;
