//! Subdomain validation and generation.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

/// DNS labels reserved for the platform itself.
pub const RESERVED_LABELS: &[&str] = &["www"];

static SUBDOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap());

/// Check whether a string is a valid subdomain label.
///
/// Accepts lowercase alphanumerics and interior hyphens, 1-63 characters.
pub fn is_valid_subdomain(subdomain: &str) -> bool {
    !subdomain.is_empty() && subdomain.len() <= 63 && SUBDOMAIN_RE.is_match(subdomain)
}

/// Generate a subdomain from a project name: lowercased, spaces and
/// underscores replaced with hyphens, plus a random 4-hex suffix so repeated
/// project names stay unique.
pub fn generate_subdomain(project_name: &str) -> String {
    let mut base: String = project_name
        .to_lowercase()
        .chars()
        .map(|c| match c {
            ' ' | '_' => '-',
            c if c.is_ascii_alphanumeric() || c == '-' => c,
            _ => '-',
        })
        .collect();

    base = base.trim_matches('-').to_string();
    if base.is_empty() {
        base = "app".to_string();
    }

    // Leave room for "-xxxx".
    base.truncate(58);
    let base = base.trim_end_matches('-');

    let suffix: u16 = rand::thread_rng().gen();
    format!("{}-{:04x}", base, suffix)
}
