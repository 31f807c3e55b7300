/// PostgreSQL truncates identifiers longer than `NAMEDATALEN - 1` bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Length of the sanitized display-name part of a tenant database name.
const NAME_PART_LEN: usize = 20;

/// Length of the tenant-id fragment appended for uniqueness.
const ID_PART_LEN: usize = 8;

/// Longest namespace prefix that still keeps every generated name within
/// `MAX_IDENTIFIER_LEN`.
pub const fn max_prefix_len() -> usize {
    MAX_IDENTIFIER_LEN - NAME_PART_LEN - 1 - ID_PART_LEN
}

/// Derives the physical database name for a tenant.
///
/// `"Greenfield Academy!"` with id `"abcd1234-..."` and prefix `"school_"`
/// becomes `school_greenfield_academy__abcd1234`. The id fragment keeps
/// tenants with similar names apart.
pub fn generate_database_name(prefix: &str, tenant_name: &str, tenant_id: &str) -> String {
    let name: String = sanitize(tenant_name).chars().take(NAME_PART_LEN).collect();
    let id: String = sanitize(tenant_id).chars().take(ID_PART_LEN).collect();
    let joined = format!("{prefix}{name}_{id}");
    if joined.starts_with(|c: char| c.is_ascii_digit()) {
        // Identifiers may not start with a digit; only reachable with an empty prefix.
        format!("_{joined}")
    } else {
        joined
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '_' })
        .collect()
}

/// Validates a database name before it is interpolated into DDL.
/// Only `[a-z0-9_]`, no leading digit, at most 63 bytes.
pub fn is_valid_database_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Double-quotes an identifier for use in DDL statements.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
