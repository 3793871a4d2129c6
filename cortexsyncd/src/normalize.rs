use crate::errors::{Error, Result};

use cortexsync_api::{FieldValue, FunctionKind, NormalizedPayload, TenantContext, WatchedObject};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/*
 * One Prometheus rule file, as stored in a ConfigMap entry:
 *
 *   groups:
 *     - name: example
 *       interval: 1m
 *       rules:
 *         - alert: HighErrorRate
 *           expr: [ ... ]
 *
 * Rules themselves are passed through untouched; validating PromQL is the
 * ruler's business. So are the group options this engine has no use for
 * (limit, query_offset, source_tenants, ...).
 */
#[derive(Debug, Serialize, Deserialize)]
struct RuleFile {
    groups: Vec<RuleGroup>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RuleGroup {
    name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    interval: Option<String>,

    rules: Vec<serde_yaml::Value>,

    #[serde(flatten)]
    options: serde_yaml::Mapping,
}

#[derive(Debug, Serialize)]
struct AlertmanagerConfig<'a> {
    alertmanager_config: &'a str,
}

fn field_text<'a>(obj: &WatchedObject, key: &str, value: &'a FieldValue) -> Result<&'a str> {
    match value {
	FieldValue::Text(text) => Ok(text.as_str()),
	FieldValue::Binary(bytes) => std::str::from_utf8(bytes)
	    .map_err(|err| Error::malformed(&obj.key, format!("binary entry `{}` is not valid UTF-8: {}", key, err))),
    }
}

/*
 * Merge the rule groups of every entry (in key order) into one rule file.
 */
fn rules_content(obj: &WatchedObject) -> Result<String> {
    let mut groups = Vec::new();
    let mut names = BTreeSet::new();

    for (key, value) in &obj.fields {
	let text = field_text(obj, key, value)?;
	let file: RuleFile = serde_yaml::from_str(text)
	    .map_err(|err| Error::malformed(&obj.key, format!("entry `{}` is not a rule file: {}", key, err)))?;

	for group in file.groups {
	    if !names.insert(group.name.clone()) {
		let errmsg = format!("rule group `{}` is defined more than once (entry `{}`)", group.name, key);
		return Err(Error::malformed(&obj.key, errmsg));
	    }
	    groups.push(group);
	}
    }

    serde_yaml::to_string(&RuleFile{ groups: groups })
	.map_err(|err| Error::malformed(&obj.key, format!("unable to encode rule groups: {}", err)))
}

fn alerts_content(obj: &WatchedObject) -> Result<String> {
    if obj.fields.len() > 1 {
	let errmsg = format!("alert definitions should only have one entry, got {}", obj.fields.len());
	return Err(Error::malformed(&obj.key, errmsg));
    }

    let (key, value) = match obj.fields.iter().next() {
	Some(entry) => entry,
	None => return Err(Error::malformed(&obj.key, "has no data")),
    };
    let text = field_text(obj, key, value)?;

    serde_yaml::from_str::<serde_yaml::Value>(text)
	.map_err(|err| Error::malformed(&obj.key, format!("entry `{}` is not valid YAML: {}", key, err)))?;

    serde_yaml::to_string(&AlertmanagerConfig{ alertmanager_config: text })
	.map_err(|err| Error::malformed(&obj.key, format!("unable to encode alertmanager config: {}", err)))
}

pub fn fingerprint(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/*
 * Build the wire payload of an object. The fingerprint only covers the
 * canonical content, so metadata churn (resourceVersion, unrelated labels)
 * never looks like a change.
 */
pub fn normalize(obj: &WatchedObject, tenant: &TenantContext, function: FunctionKind) -> Result<NormalizedPayload> {
    if obj.fields.is_empty() {
	return Err(Error::malformed(&obj.key, "has no data"));
    }

    let content = match function {
	FunctionKind::Rules => rules_content(obj)?,
	FunctionKind::Alerts => alerts_content(obj)?,
    };
    let content = content.into_bytes();

    Ok(NormalizedPayload{
	tenant: tenant.tenant.clone(),
	function: function,
	fingerprint: fingerprint(&content),
	content: content,
    })
}
