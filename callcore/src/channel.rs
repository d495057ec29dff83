//! Channel naming shared by both parties of a call.
//!
//! Names depend only on the id they are derived from, so caller and
//! receiver reach the same channel without coordinating.

use crate::types::call::{CallId, UserId};

pub fn signal_channel(call_id: &CallId) -> String {
    format!("call-signals-{}", call_id)
}

pub fn incoming_calls_channel(user_id: &UserId) -> String {
    format!("incoming-calls-{}", user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_are_deterministic() {
        let id = CallId::new("AC90CFD09DF712D981142B172706F9F2");
        assert_eq!(
            signal_channel(&id),
            "call-signals-AC90CFD09DF712D981142B172706F9F2"
        );
        assert_eq!(signal_channel(&id), signal_channel(&id.clone()));
        assert_eq!(
            incoming_calls_channel(&UserId::new("bob")),
            "incoming-calls-bob"
        );
    }
}
