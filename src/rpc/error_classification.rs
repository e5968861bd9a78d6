use std::time::Duration;

use crate::config::EngineConfig;
use crate::datacenter::address::DatacenterId;

const FLOOD_WAIT: i32 = 420;
const SEE_OTHER: i32 = 303;
const UNAUTHORIZED: i32 = 401;

const FATAL_AUTH_DESCRIPTIONS: [&str; 6] = [
    "AUTH_KEY_UNREGISTERED",
    "AUTH_KEY_INVALID",
    "AUTH_KEY_DUPLICATED",
    "SESSION_REVOKED",
    "SESSION_EXPIRED",
    "USER_DEACTIVATED",
];

/// 401 errors that ask the user for something (e.g. the 2FA password) without invalidating the key
const RECOVERABLE_UNAUTHORIZED: [&str; 1] = ["SESSION_PASSWORD_NEEDED"];

/// Migrations that move the account's home datacenter, as opposed to migrations that only apply
///  to a single request (e.g. `FILE_MIGRATE_x`)
const HOME_MIGRATIONS: [&str; 3] = ["USER_MIGRATE_", "PHONE_MIGRATE_", "NETWORK_MIGRATE_"];

/// What the engine does about an `rpc_error`
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RpcErrorKind {
    /// the server asks us to wait before repeating the request
    FloodWait(Duration),
    /// transient server side failure, repeated after a fixed delay a bounded number of times
    InternalError(Duration),
    Migrate(DatacenterId),
    FatalAuth,
    Generic,
}

impl RpcErrorKind {
    pub fn classify(error_code: i32, description: &str, config: &EngineConfig) -> RpcErrorKind {
        if FATAL_AUTH_DESCRIPTIONS.iter().any(|d| has_token(description, d)) {
            return RpcErrorKind::FatalAuth;
        }

        match error_code {
            FLOOD_WAIT => {
                let wait = numeric_suffix(description, "FLOOD_WAIT_")
                    .or_else(|| numeric_suffix(description, "SLOWMODE_WAIT_"));
                match wait {
                    Some(secs) if Duration::from_secs(secs) <= config.max_flood_wait => RpcErrorKind::FloodWait(Duration::from_secs(secs)),
                    _ => RpcErrorKind::Generic,
                }
            }
            SEE_OTHER => {
                match numeric_suffix(description, "_MIGRATE_").and_then(|dc| i32::try_from(dc).ok()) {
                    Some(dc) => RpcErrorKind::Migrate(DatacenterId(dc)),
                    None => RpcErrorKind::Generic,
                }
            }
            UNAUTHORIZED if RECOVERABLE_UNAUTHORIZED.iter().any(|d| has_token(description, d)) => RpcErrorKind::Generic,
            UNAUTHORIZED => RpcErrorKind::FatalAuth,
            500 | -500 | -503 => RpcErrorKind::InternalError(config.internal_error_retry_delay),
            _ => RpcErrorKind::Generic,
        }
    }
}

/// Whether a migrate error's description names a move of the home datacenter, accepting the same
///  forms as [RpcErrorKind::classify], e.g. `"303 USER_MIGRATE_4"`
pub fn is_home_migration(description: &str) -> bool {
    HOME_MIGRATIONS.iter()
        .any(|marker| numeric_suffix(description, marker).is_some())
}

fn has_token(description: &str, token: &str) -> bool {
    description.split_whitespace()
        .any(|t| t == token)
}

/// Finds `marker` in any whitespace separated token of the description and parses the digits
///  that follow it, e.g. `"420 FLOOD_WAIT_30"` with marker `FLOOD_WAIT_` yields 30.
fn numeric_suffix(description: &str, marker: &str) -> Option<u64> {
    description.split_whitespace()
        .filter_map(|token| token.find(marker).map(|pos| &token[pos + marker.len()..]))
        .find_map(|suffix| suffix.parse().ok())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;
    use RpcErrorKind::*;

    #[rstest]
    #[case::flood_wait(420, "FLOOD_WAIT_30", FloodWait(Duration::from_secs(30)))]
    #[case::flood_wait_with_code(420, "420 FLOOD_WAIT_30", FloodWait(Duration::from_secs(30)))]
    #[case::slowmode(420, "SLOWMODE_WAIT_5", FloodWait(Duration::from_secs(5)))]
    #[case::flood_wait_at_cap(420, "FLOOD_WAIT_300", FloodWait(Duration::from_secs(300)))]
    #[case::flood_wait_too_long(420, "FLOOD_WAIT_301", Generic)]
    #[case::flood_wait_unparseable(420, "FLOOD_WAIT_X", Generic)]
    #[case::flood_other(420, "FROZEN_METHOD", Generic)]
    #[case::phone_migrate(303, "PHONE_MIGRATE_2", Migrate(DatacenterId(2)))]
    #[case::file_migrate(303, "303 FILE_MIGRATE_4", Migrate(DatacenterId(4)))]
    #[case::migrate_no_dc(303, "USER_MIGRATE_", Generic)]
    #[case::unauthorized(401, "AUTH_KEY_PERM_EMPTY", FatalAuth)]
    #[case::unregistered(401, "AUTH_KEY_UNREGISTERED", FatalAuth)]
    #[case::password_needed(401, "SESSION_PASSWORD_NEEDED", Generic)]
    #[case::password_needed_with_code(401, "401 SESSION_PASSWORD_NEEDED", Generic)]
    #[case::revoked_with_other_code(400, "SESSION_REVOKED", FatalAuth)]
    #[case::deactivated(400, "USER_DEACTIVATED", FatalAuth)]
    #[case::internal(500, "INTERNAL", InternalError(Duration::from_secs(1)))]
    #[case::internal_negative(-500, "No workers running", InternalError(Duration::from_secs(1)))]
    #[case::timeout(-503, "Timeout", InternalError(Duration::from_secs(1)))]
    #[case::bad_request(400, "PEER_ID_INVALID", Generic)]
    #[case::similar_token(400, "SESSION_REVOKED_SOMEHOW", Generic)]
    fn test_classify(#[case] code: i32, #[case] description: &str, #[case] expected: RpcErrorKind) {
        assert_eq!(RpcErrorKind::classify(code, description, &EngineConfig::new()), expected);
    }

    #[rstest]
    #[case::user("USER_MIGRATE_4", true)]
    #[case::user_with_code("303 USER_MIGRATE_4", true)]
    #[case::phone("PHONE_MIGRATE_2", true)]
    #[case::network_with_code("303 NETWORK_MIGRATE_1", true)]
    #[case::file("FILE_MIGRATE_4", false)]
    #[case::file_with_code("303 FILE_MIGRATE_4", false)]
    #[case::stats("STATS_MIGRATE_3", false)]
    #[case::no_dc("USER_MIGRATE_", false)]
    fn test_is_home_migration(#[case] description: &str, #[case] expected: bool) {
        assert_eq!(is_home_migration(description), expected);
    }
}
