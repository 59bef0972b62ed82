//! Tenant scoping for query templates.
//!
//! Handlers never interpolate a tenant value into SQL. The guard rewrites a
//! template to carry a `<column> = :tenant_id` predicate and hands back the
//! value to bind, after checking that the caller may touch the target tenant
//! at all. This sits on top of whatever row filters the database enforces.

use sentinel_common::TenantContext;

use crate::error::{DbError, DbErrorKind};

/// The column the injected predicate compares against.
pub const TENANT_COLUMN: &str = "tenant_id";

/// A rewritten template plus the value to bind as `:tenant_id`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GuardedQuery {
    pub sql: String,
    pub tenant_id: String,
}

/// Verifies access and injects the tenant predicate into `sql`.
pub fn guard_query(
    sql: &str,
    context: &TenantContext,
    target_tenant: &str,
) -> Result<GuardedQuery, DbError> {
    if target_tenant.is_empty() {
        return Err(DbErrorKind::Guard("empty tenant id".to_owned()).into());
    }
    if !context.can_access(target_tenant) {
        return Err(DbErrorKind::CrossTenantAccess.into());
    }

    Ok(GuardedQuery {
        sql: inject_tenant_filter(sql, TENANT_COLUMN)?,
        tenant_id: target_tenant.to_owned(),
    })
}

/// Rewrites `sql` so it filters on `column = :tenant_id`.
///
/// The first top-level `WHERE` gains the predicate AND-ed in front of its
/// existing condition; otherwise a new `WHERE` clause lands before the
/// earliest `ORDER BY`/`GROUP BY`, or at the end. Keyword detection is
/// case-insensitive, bounded by non-identifier characters, and blind inside
/// single- and double-quoted literals.
pub fn inject_tenant_filter(sql: &str, column: &str) -> Result<String, DbError> {
    if sql.trim().is_empty() {
        return Err(DbErrorKind::Guard("empty sql template".to_owned()).into());
    }
    if column.is_empty() {
        return Err(DbErrorKind::Guard("empty tenant column".to_owned()).into());
    }

    let predicate = format!("{} = :tenant_id", column);
    match find_clause_positions(sql) {
        ClausePositions {
            where_end: Some(end),
            ..
        } => {
            // "... WHERE <rest>" becomes "... WHERE <pred> AND <rest>".
            let rest = sql[end..].trim_start();
            Ok(format!("{} {} AND {}", &sql[..end], predicate, rest))
        }
        ClausePositions {
            tail_start: Some(start),
            ..
        } => {
            let head = sql[..start].trim_end();
            Ok(format!("{} WHERE {} {}", head, predicate, &sql[start..]))
        }
        _ => Ok(format!("{} WHERE {}", sql.trim_end(), predicate)),
    }
}

#[derive(Debug, Default)]
struct ClausePositions {
    /// Byte offset just past the first top-level `WHERE` keyword.
    where_end: Option<usize>,
    /// Byte offset of the earliest top-level `ORDER BY` / `GROUP BY`.
    tail_start: Option<usize>,
}

fn find_clause_positions(sql: &str) -> ClausePositions {
    let bytes = sql.as_bytes();
    let mut positions = ClausePositions::default();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_single {
            if b == b'\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }
        if in_double {
            if b == b'"' {
                in_double = false;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' => {
                in_single = true;
                i += 1;
            }
            b'"' => {
                in_double = true;
                i += 1;
            }
            _ if is_ident_byte(b) => {
                let start = i;
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                // A word qualifies only when bounded by non-identifier
                // characters; the scan above guarantees both sides.
                let word = &sql[start..i];
                if word.eq_ignore_ascii_case("where") {
                    if positions.where_end.is_none() && positions.tail_start.is_none() {
                        positions.where_end = Some(i);
                    }
                } else if word.eq_ignore_ascii_case("order") || word.eq_ignore_ascii_case("group") {
                    if next_word_is_by(sql, i)
                        && positions.where_end.is_none()
                        && positions.tail_start.is_none()
                    {
                        positions.tail_start = Some(start);
                    }
                }
            }
            _ => {
                i += 1;
            }
        }
    }

    positions
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'#'
}

fn next_word_is_by(sql: &str, from: usize) -> bool {
    let rest = sql[from..].trim_start();
    let bytes = rest.as_bytes();
    bytes.len() >= 2
        && rest[..2].eq_ignore_ascii_case("by")
        && bytes.get(2).map_or(true, |&b| !is_ident_byte(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_occurrences(haystack: &str, needle: &str) -> usize {
        haystack.matches(needle).count()
    }

    #[test]
    fn existing_where_gains_the_predicate_up_front() {
        let sql = "SELECT * FROM users WHERE status = 'active'";
        let out = inject_tenant_filter(sql, "tenant_id").unwrap();
        assert_eq!(
            out,
            "SELECT * FROM users WHERE tenant_id = :tenant_id AND status = 'active'"
        );
    }

    #[test]
    fn order_by_without_where_gets_a_clause_before_it() {
        let sql = "SELECT * FROM users ORDER BY id";
        let out = inject_tenant_filter(sql, "tenant_id").unwrap();
        assert_eq!(
            out,
            "SELECT * FROM users WHERE tenant_id = :tenant_id ORDER BY id"
        );
    }

    #[test]
    fn group_by_without_where_gets_a_clause_before_it() {
        let sql = "SELECT status, COUNT(*) FROM jobs GROUP BY status";
        let out = inject_tenant_filter(sql, "tenant_id").unwrap();
        assert_eq!(
            out,
            "SELECT status, COUNT(*) FROM jobs WHERE tenant_id = :tenant_id GROUP BY status"
        );
    }

    #[test]
    fn bare_selects_get_a_trailing_clause() {
        let out = inject_tenant_filter("SELECT * FROM jobs", "tenant_id").unwrap();
        assert_eq!(out, "SELECT * FROM jobs WHERE tenant_id = :tenant_id");
    }

    #[test]
    fn keywords_inside_string_literals_are_ignored() {
        let sql = "SELECT * FROM notes WHERE body = 'where order by group by'";
        let out = inject_tenant_filter(sql, "tenant_id").unwrap();
        assert_eq!(
            out,
            "SELECT * FROM notes WHERE tenant_id = :tenant_id AND body = 'where order by group by'"
        );
    }

    #[test]
    fn keywords_inside_quoted_identifiers_are_ignored() {
        let sql = "SELECT \"WHERE\" FROM t ORDER BY 1";
        let out = inject_tenant_filter(sql, "tenant_id").unwrap();
        assert_eq!(
            out,
            "SELECT \"WHERE\" FROM t WHERE tenant_id = :tenant_id ORDER BY 1"
        );
    }

    #[test]
    fn identifiers_containing_keywords_do_not_match() {
        let sql = "SELECT nowhere, ordering FROM t";
        let out = inject_tenant_filter(sql, "tenant_id").unwrap();
        assert_eq!(out, "SELECT nowhere, ordering FROM t WHERE tenant_id = :tenant_id");
    }

    #[test]
    fn detection_is_case_insensitive() {
        let out = inject_tenant_filter("select * from t where x = 1 Order By x", "tenant_id")
            .unwrap();
        assert_eq!(
            out,
            "select * from t where tenant_id = :tenant_id AND x = 1 Order By x"
        );
    }

    #[test]
    fn predicate_appears_exactly_once_and_before_any_tail_clause() {
        for sql in [
            "SELECT * FROM a",
            "SELECT * FROM a WHERE x = 'ORDER BY'",
            "SELECT * FROM a ORDER BY x",
            "SELECT * FROM a GROUP BY x ORDER BY x",
            "SELECT * FROM a WHERE y = 1 GROUP BY x",
        ] {
            let out = inject_tenant_filter(sql, "tenant_id").unwrap();
            assert_eq!(
                count_occurrences(&out, "tenant_id = :tenant_id"),
                1,
                "{}",
                out
            );
            let predicate_at = out.find("tenant_id = :tenant_id").unwrap();
            for tail in ["ORDER BY", "GROUP BY"] {
                if let Some(tail_at) = out.find(tail) {
                    assert!(predicate_at < tail_at, "{}", out);
                }
            }
        }
    }

    #[test]
    fn empty_inputs_are_programmer_errors() {
        assert!(inject_tenant_filter("   ", "tenant_id").is_err());
        assert!(inject_tenant_filter("SELECT 1 FROM dual", "").is_err());

        let ctx = TenantContext::new("T1");
        assert!(matches!(
            guard_query("SELECT * FROM t", &ctx, "").map_err(|e| e.is_cross_tenant()),
            Err(false)
        ));
    }

    #[test]
    fn cross_tenant_access_is_denied_for_plain_contexts() {
        let ctx = TenantContext::new("T1");
        let err = guard_query("SELECT * FROM t", &ctx, "T2").unwrap_err();
        assert!(err.is_cross_tenant());
    }

    #[test]
    fn admin_and_system_contexts_cross_tenants() {
        let admin = TenantContext {
            roles: vec!["admin".to_owned()],
            ..TenantContext::new("T1")
        };
        let guarded = guard_query("SELECT * FROM t", &admin, "T2").unwrap();
        assert_eq!(guarded.tenant_id, "T2");
        assert!(guarded.sql.contains("tenant_id = :tenant_id"));

        let system = TenantContext {
            is_system: true,
            ..TenantContext::new("ops")
        };
        assert!(guard_query("SELECT * FROM t", &system, "T9").is_ok());
    }

    #[test]
    fn scenario_tenant_guard_with_existing_where() {
        let ctx = TenantContext::new("T42");
        let guarded =
            guard_query("SELECT * FROM users WHERE status = 'active'", &ctx, "T42").unwrap();
        assert!(guarded
            .sql
            .contains("WHERE tenant_id = :tenant_id AND status = 'active'"));
        assert_eq!(guarded.tenant_id, "T42");
    }
}
