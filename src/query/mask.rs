use lazy_static::lazy_static;
use regex::Regex;

const MASK: &str = "'*****'";

lazy_static! {
    static ref PASSWORD_PATTERNS: Vec<Regex> = vec![
        // CREATE USER / ALTER USER / GRANT ... IDENTIFIED BY [PASSWORD] 'secret'
        Regex::new(r#"(?i)(\bIDENTIFIED\s+(?:WITH\s+\w+\s+)?(?:BY|AS|USING)(?:\s+PASSWORD)?\s*)('(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*")"#)
            .expect("valid regex"),
        // PASSWORD('secret'), OLD_PASSWORD('secret')
        Regex::new(r#"(?i)(\bPASSWORD\s*\(\s*)('(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*")"#)
            .expect("valid regex"),
        // SET PASSWORD [FOR user] = 'secret'
        Regex::new(r#"(?i)(\bSET\s+PASSWORD\b[^=;]*=\s*)('(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*")"#)
            .expect("valid regex"),
        // MASTER_PASSWORD='secret', password=secret in option lists
        Regex::new(r#"(?i)(\b\w*PASSWORD\s*=\s*)('(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*"|[^\s;,()'"]+)"#)
            .expect("valid regex"),
    ];
}

/// Replaces inline credentials in `sql` so the statement can be stored in
/// the query history or a snippet.
pub fn mask_query_pwd(sql: &str) -> String {
    PASSWORD_PATTERNS
        .iter()
        .fold(sql.to_string(), |masked, pattern| {
            pattern
                .replace_all(&masked, |caps: &regex::Captures| {
                    if &caps[2] == MASK {
                        caps[0].to_string()
                    } else {
                        format!("{}{}", &caps[1], MASK)
                    }
                })
                .into_owned()
        })
}
