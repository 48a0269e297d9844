//! The identity oracle contract consumed by the request server, and the
//! extraction of ACL rules from a caller's capability grant.

use std::collections::HashMap;

use cellar_core::error::{CResult, Error};
use cellar_core::model::{Caller, Principal};
use cellar_core::policy::Rule;
use serde_json::Value;

/// The capability key under which `Rule` objects are expected to appear in
/// a principal's capability map.
pub const SECRETS_CAPABILITY_KEY: &str = "cellar.dev/cap/secrets";

/// What a host-supplied identity oracle resolves a remote address to.
#[derive(Clone, Debug, Default)]
pub struct Identity {
    pub node_name: String,
    pub tags: Vec<String>,
    pub user_login: Option<String>,
    pub capability_map: HashMap<String, Vec<Value>>,
}

/// Resolves a connection's remote address to an [`Identity`]. Not
/// implemented here -- a deployment supplies its own, backed by whatever
/// network identity system it already trusts.
pub trait IdentityOracle: Send + Sync {
    fn resolve(&self, remote_addr: &str) -> CResult<Identity>;
}

/// Extracts the caller's [`Rule`]s from its capability grant and builds a
/// [`Caller`] ready to hand to `cellar_core::facade::Database`.
pub fn caller_from_identity(identity: Identity) -> CResult<Caller> {
    let principal = Principal {
        node: identity.node_name,
        addr: String::new(),
        user_login: identity.user_login,
        tags: identity.tags,
    };

    let mut rules = Vec::new();
    if let Some(grants) = identity.capability_map.get(SECRETS_CAPABILITY_KEY) {
        for grant in grants {
            let rule: Rule = serde_json::from_value(grant.clone())
                .map_err(|err| Error::internal(format!("invalid capability grant: {err}")))?;
            rules.push(rule);
        }
    }

    Ok(Caller { principal, rules })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_rules_from_capability_map() {
        let mut capability_map = HashMap::new();
        capability_map.insert(
            SECRETS_CAPABILITY_KEY.to_string(),
            vec![json!({
                "principal": ["tag:ok"],
                "action": ["get"],
                "secret": ["*"],
            })],
        );
        let identity = Identity {
            node_name: "node-1".into(),
            tags: vec!["tag:ok".into()],
            user_login: None,
            capability_map,
        };
        let caller = caller_from_identity(identity).unwrap();
        assert_eq!(caller.rules.len(), 1);
        assert_eq!(caller.principal.tags, vec!["tag:ok".to_string()]);
    }

    #[test]
    fn missing_capability_key_yields_no_rules() {
        let identity = Identity {
            node_name: "node-1".into(),
            tags: vec!["tag:ok".into()],
            user_login: None,
            capability_map: HashMap::new(),
        };
        let caller = caller_from_identity(identity).unwrap();
        assert!(caller.rules.is_empty());
    }

    #[test]
    fn malformed_grant_is_an_internal_error() {
        let mut capability_map = HashMap::new();
        capability_map.insert(
            SECRETS_CAPABILITY_KEY.to_string(),
            vec![json!({"not": "a rule"})],
        );
        let identity = Identity {
            node_name: "node-1".into(),
            tags: vec![],
            user_login: None,
            capability_map,
        };
        assert!(matches!(
            caller_from_identity(identity),
            Err(Error::Internal(_))
        ));
    }
}
