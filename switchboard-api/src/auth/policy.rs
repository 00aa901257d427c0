//! Authorization policy, evaluated after authentication succeeds: any
//! match grants, all lists empty means any authenticated principal is
//! permitted.

use regex::{Regex, RegexBuilder};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("invalid allowed_user_regex {pattern:?}: {detail}")]
pub struct PolicyError {
    pattern: String,
    detail: String,
}

#[derive(Debug, Default)]
pub struct ProviderPolicy {
    allowed_users: Vec<String>,
    allowed_domains: Vec<String>,
    allowed_user_regex: Vec<Regex>,
}

impl ProviderPolicy {
    pub fn new(
        allowed_users: &[String],
        allowed_domains: &[String],
        allowed_user_regex: &[String],
    ) -> Result<Self, PolicyError> {
        let allowed_user_regex = allowed_user_regex
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| PolicyError {
                        pattern: pattern.clone(),
                        detail: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allowed_users: allowed_users.to_vec(),
            allowed_domains: allowed_domains.to_vec(),
            allowed_user_regex,
        })
    }

    pub fn is_unrestricted(&self) -> bool {
        self.allowed_users.is_empty()
            && self.allowed_domains.is_empty()
            && self.allowed_user_regex.is_empty()
    }

    /// Whether an authenticated identity (typically an email) is permitted.
    pub fn allows(&self, identity: &str) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        if self
            .allowed_users
            .iter()
            .any(|user| user.eq_ignore_ascii_case(identity))
        {
            return true;
        }
        if let Some((_, domain)) = identity.rsplit_once('@') {
            if self
                .allowed_domains
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(domain))
            {
                return true;
            }
        }
        self.allowed_user_regex
            .iter()
            .any(|regex| regex.is_match(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn empty_policy_allows_anyone() {
        let policy = ProviderPolicy::new(&[], &[], &[]).unwrap();
        assert!(policy.is_unrestricted());
        assert!(policy.allows("anyone@anywhere.example"));
    }

    #[test]
    fn domain_allow_list_gates_by_email_domain() {
        let policy = ProviderPolicy::new(&[], &strings(&["company.com"]), &[]).unwrap();
        assert!(policy.allows("alice@company.com"));
        assert!(policy.allows("Alice@COMPANY.COM"));
        assert!(!policy.allows("external@other.com"));
        assert!(!policy.allows("no-at-sign"));
    }

    #[test]
    fn any_matching_rule_grants() {
        let policy = ProviderPolicy::new(
            &strings(&["bot@partner.net"]),
            &strings(&["company.com"]),
            &strings(&["^svc-.*@automation\\.example$"]),
        )
        .unwrap();
        assert!(policy.allows("bot@partner.net"));
        assert!(policy.allows("carol@company.com"));
        assert!(policy.allows("SVC-deploy@automation.example"));
        assert!(!policy.allows("mallory@evil.example"));
    }

    #[test]
    fn bad_regex_is_rejected_at_construction() {
        assert!(ProviderPolicy::new(&[], &[], &strings(&["[unclosed"])).is_err());
    }
}
