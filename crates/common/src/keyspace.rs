// Key-value keyspace shared by every trackcast process.
//
// | Key | Value | TTL |
// |---|---|---|
// | `<bookingID>` | booking record | token TTL |
// | `<driverID>` | driver record | token TTL |
// | `l<partition>` | last known location blob | keep-TTL |
// | `c<partition>` | viewer connection counter | token TTL |
// | `n<partition>` | backup record | token TTL + 12h |
// | pool key | set of occupied partitions | none |
// | `<pool key>:lock` | allocator lease marker | lock lease |

use std::time::Duration;

pub const DEFAULT_POOL_KEY: &str = "partition_manager";

/// Extra lifetime of the backup record beyond the session token, so that a
/// session whose producer crashed can still be archived by the reaper.
pub const BACKUP_TTL_EXTENSION: Duration = Duration::from_secs(12 * 60 * 60);

pub fn booking_key(booking_id: &str) -> String {
    booking_id.to_owned()
}

pub fn driver_key(driver_id: i64) -> String {
    driver_id.to_string()
}

pub fn live_location_key(partition: u32) -> String {
    format!("l{partition}")
}

pub fn connection_counter_key(partition: u32) -> String {
    format!("c{partition}")
}

pub fn backup_key(partition: u32) -> String {
    format!("n{partition}")
}

pub fn pool_lock_key(pool_key: &str) -> String {
    format!("{pool_key}:lock")
}

/// Pool members are stored as decimal partition ids.
pub fn pool_member(partition: u32) -> String {
    partition.to_string()
}

pub fn parse_pool_member(member: &str) -> Option<u32> {
    member.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_keys_use_single_letter_prefixes() {
        assert_eq!(live_location_key(3), "l3");
        assert_eq!(connection_counter_key(0), "c0");
        assert_eq!(backup_key(12), "n12");
    }

    #[test]
    fn pool_members_round_trip_and_reject_garbage() {
        assert_eq!(parse_pool_member(&pool_member(7)), Some(7));
        assert_eq!(parse_pool_member("seven"), None);
        assert_eq!(parse_pool_member("-1"), None);
    }

    #[test]
    fn lock_key_is_derived_from_pool_key() {
        assert_eq!(pool_lock_key(DEFAULT_POOL_KEY), "partition_manager:lock");
    }
}
