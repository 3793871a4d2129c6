use std::fmt;
use std::str::FromStr;

/*
 * Which half of the rule-management API this process feeds.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    /*
     * ruler: Prometheus style rule groups
     */
    Rules,

    /*
     * alertmanager: one alertmanager configuration per tenant
     */
    Alerts,
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	match self {
	    FunctionKind::Rules => write!(f, "rules"),
	    FunctionKind::Alerts => write!(f, "alerts"),
	}
    }
}

impl FromStr for FunctionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
	match s {
	    "rules" => Ok(FunctionKind::Rules),
	    "alerts" => Ok(FunctionKind::Alerts),
	    other => Err(format!("unknown function `{}`, valid values are: rules, alerts", other)),
	}
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TenantSource {
    /* read from the namespace label */
    Label,

    /* the label was absent or the namespace couldn't be read */
    Default,
}

impl fmt::Display for TenantSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	match self {
	    TenantSource::Label => write!(f, "label"),
	    TenantSource::Default => write!(f, "default"),
	}
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub namespace: String,
    pub tenant: String,
    pub source: TenantSource,
}

impl TenantContext {

    pub fn from_label(namespace: &str, tenant: &str) -> Self {
	Self{
	    namespace: namespace.to_string(),
	    tenant: tenant.to_string(),
	    source: TenantSource::Label,
	}
    }

    pub fn default_for(namespace: &str, tenant: &str) -> Self {
	Self{
	    namespace: namespace.to_string(),
	    tenant: tenant.to_string(),
	    source: TenantSource::Default,
	}
    }
}

/*
 * The wire form of an object's rule or alert content, plus a digest of it.
 * Two payloads with the same fingerprint are interchangeable on the wire.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPayload {
    pub tenant: String,
    pub function: FunctionKind,
    pub content: Vec<u8>,
    pub fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_names_parse_back() {
	for kind in [FunctionKind::Rules, FunctionKind::Alerts] {
	    assert_eq!(kind.to_string().parse::<FunctionKind>(), Ok(kind));
	}

	let err = "recording".parse::<FunctionKind>().unwrap_err();
	assert!(err.contains("valid values are: rules, alerts"), "{}", err);
    }
}
