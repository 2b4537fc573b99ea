//! PostgreSQL dialect helpers. All SQL the crate generates dynamically is
//! assembled from these fragments so dialect decisions live in one place.

pub fn now() -> &'static str {
    "NOW()"
}

pub fn generate_uuid() -> &'static str {
    "gen_random_uuid()"
}

/// An interval literal, e.g. `interval_secs(90)` -> `INTERVAL '90 seconds'`.
pub fn interval_secs(secs: i64) -> String {
    format!("INTERVAL '{secs} seconds'")
}

pub fn for_update_skip_locked() -> &'static str {
    "FOR UPDATE SKIP LOCKED"
}

pub fn on_conflict_do_nothing(cols: &[&str]) -> String {
    if cols.is_empty() {
        "ON CONFLICT DO NOTHING".to_string()
    } else {
        format!("ON CONFLICT ({}) DO NOTHING", cols.join(", "))
    }
}

pub fn returning(cols: &[&str]) -> String {
    format!("RETURNING {}", cols.join(", "))
}

/// COUNT(*) comes back as BIGINT; cast in SQL so callers read i64 uniformly.
pub fn count_as_int(expr: &str) -> String {
    format!("COUNT({expr})::BIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_render_expected_sql() {
        assert_eq!(interval_secs(90), "INTERVAL '90 seconds'");
        assert_eq!(
            on_conflict_do_nothing(&["id", "topic"]),
            "ON CONFLICT (id, topic) DO NOTHING"
        );
        assert_eq!(on_conflict_do_nothing(&[]), "ON CONFLICT DO NOTHING");
        assert_eq!(returning(&["id"]), "RETURNING id");
        assert_eq!(count_as_int("*"), "COUNT(*)::BIGINT");
    }
}
