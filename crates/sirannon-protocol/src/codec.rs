//! BigInt-safe JSON encoding: integers within `[-(2^53-1), 2^53-1]` are
//! encoded as JSON numbers; integers outside that range are encoded as
//! decimal strings so a JavaScript (or any float64-backed) client can
//! reconstruct them exactly via an arbitrary-precision parse instead of
//! silently losing precision.

use serde_json::{json, Value as Json};
use sirannon_core::executor::ExecuteResult;
use sirannon_core::tracker::ChangeEvent;
use sirannon_core::value::row_to_json;

/// The largest (and, by symmetry, smallest negated) integer a float64 can
/// represent without loss: `2^53 - 1`.
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Encodes `value` as a JSON number when it is within the float64-safe
/// range, or as a decimal string otherwise.
pub fn to_wire_int(value: i64) -> Json {
    if value.abs() <= MAX_SAFE_INTEGER {
        json!(value)
    } else {
        json!(value.to_string())
    }
}

/// Converts an [`ExecuteResult`] into its wire shape
/// `{changes, lastInsertRowId}`, passing `changes` through as a plain
/// number (row counts never approach the unsafe range) and routing
/// `lastInsertRowId` through [`to_wire_int`].
pub fn to_execute_response(result: &ExecuteResult) -> Json {
    json!({
        "changes": result.changes,
        "lastInsertRowId": to_wire_int(result.last_insert_row_id),
    })
}

/// Converts a polled [`ChangeEvent`] into its wire shape, with `seq`
/// routed through [`to_wire_int`] the same way `lastInsertRowId` is.
pub fn to_change_event_json(event: &ChangeEvent) -> Json {
    json!({
        "kind": match event.kind {
            sirannon_core::tracker::ChangeKind::Insert => "insert",
            sirannon_core::tracker::ChangeKind::Update => "update",
            sirannon_core::tracker::ChangeKind::Delete => "delete",
        },
        "table": event.table,
        "row": event.row.as_ref().map(row_to_json),
        "oldRow": event.old_row.as_ref().map(row_to_json),
        "seq": to_wire_int(event.seq),
        "timestamp": event.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_integers_pass_through_as_numbers() {
        assert_eq!(to_wire_int(42), json!(42));
        assert_eq!(to_wire_int(MAX_SAFE_INTEGER), json!(MAX_SAFE_INTEGER));
    }

    #[test]
    fn integers_beyond_safe_range_become_strings() {
        let big = MAX_SAFE_INTEGER + 2;
        assert_eq!(to_wire_int(big), json!(big.to_string()));
        assert_eq!(to_wire_int(-big), json!((-big).to_string()));
    }

    #[test]
    fn execute_response_stringifies_only_the_unsafe_row_id() {
        let result = ExecuteResult {
            changes: 1,
            last_insert_row_id: 9_007_199_254_740_993,
        };
        let wire = to_execute_response(&result);
        assert_eq!(wire["changes"], json!(1));
        assert_eq!(wire["lastInsertRowId"], json!("9007199254740993"));
    }
}
