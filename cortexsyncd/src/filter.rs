use cortexsync_api::WatchedObject;
use regex::Regex;

/*
 * Alternate inclusion path for objects generated by an operator, which
 * can't be taught to put our label on them: the name must match the
 * operator's naming scheme and the object must carry the operator's own
 * label.
 */
#[derive(Debug, Clone)]
pub struct OperatorMatch {
    pattern: Regex,
    label_key: String,
    label_value: String,
}

impl OperatorMatch {

    pub fn new(pattern: Regex, label_key: &str, label_value: &str) -> Self {
	Self{
	    pattern: pattern,
	    label_key: label_key.to_string(),
	    label_value: label_value.to_string(),
	}
    }

    fn matches(&self, obj: &WatchedObject) -> bool {
	self.pattern.is_match(obj.name()) && obj.label(&self.label_key) == Some(self.label_value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ResourceFilter {
    label: String,
    label_value: Option<String>,
    operator: Option<OperatorMatch>,
}

impl ResourceFilter {

    pub fn new(label: &str, label_value: Option<String>, operator: Option<OperatorMatch>) -> Self {
	Self{
	    label: label.to_string(),
	    label_value: label_value,
	    operator: operator,
	}
    }

    fn matches_label(&self, obj: &WatchedObject) -> bool {
	match (obj.label(&self.label), &self.label_value) {
	    (None, _) => false,
	    (Some(_), None) => true,
	    (Some(value), Some(expected)) => value == expected,
	}
    }

    /*
     * Whether the object is in scope, through the label or the operator
     * path. Both paths yield one and the same decision, so an object
     * matching both is still handled once.
     */
    pub fn matches(&self, obj: &WatchedObject) -> bool {
	if self.matches_label(obj) {
	    return true;
	}

	match &self.operator {
	    Some(operator) => operator.matches(obj),
	    None => false,
	}
    }

    /*
     * Server side label selector for the watch. When the operator path is
     * on, objects without our label are in scope too, so nothing can be
     * filtered server side.
     */
    pub fn label_selector(&self) -> Option<String> {
	if self.operator.is_some() {
	    return None;
	}

	match &self.label_value {
	    Some(value) => Some(format!("{}={}", self.label, value)),
	    None => Some(self.label.clone()),
	}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortexsync_api::ObjectKey;
    use std::collections::BTreeMap;

    fn object(name: &str, labels: &[(&str, &str)]) -> WatchedObject {
	WatchedObject{
	    key: ObjectKey::configmap("ns-a", name),
	    labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
	    fields: BTreeMap::new(),
	    resource_version: None,
	}
    }

    fn operator() -> OperatorMatch {
	let pattern = Regex::new("^(?:prometheus-.*-rulefiles.*)$").unwrap();
	OperatorMatch::new(pattern, "managed-by", "prometheus-operator")
    }

    #[test]
    fn label_key_without_value_matches_any_value() {
	let filter = ResourceFilter::new("app", None, None);

	assert!(filter.matches(&object("cm1", &[("app", "foo")])));
	assert!(filter.matches(&object("cm1", &[("app", "")])));
	assert!(!filter.matches(&object("cm2", &[("other", "foo")])));
    }

    #[test]
    fn label_value_must_match_exactly() {
	let filter = ResourceFilter::new("app", Some("foo".to_string()), None);

	assert!(filter.matches(&object("cm1", &[("app", "foo")])));
	assert!(!filter.matches(&object("cm1", &[("app", "foobar")])));
	assert!(!filter.matches(&object("cm1", &[])));
    }

    #[test]
    fn operator_path_needs_name_and_label() {
	let filter = ResourceFilter::new("app", Some("foo".to_string()), Some(operator()));

	let generated = object("prometheus-k8s-rulefiles-0", &[("managed-by", "prometheus-operator")]);
	assert!(filter.matches(&generated));

	let wrong_name = object("alertmanager-rulefiles", &[("managed-by", "prometheus-operator")]);
	assert!(!filter.matches(&wrong_name));

	let unlabelled = object("prometheus-k8s-rulefiles-0", &[]);
	assert!(!filter.matches(&unlabelled));
    }

    #[test]
    fn object_matching_both_paths_is_in_scope() {
	let filter = ResourceFilter::new("app", None, Some(operator()));
	let both = object("prometheus-k8s-rulefiles-0", &[("app", "x"), ("managed-by", "prometheus-operator")]);

	assert!(filter.matches(&both));
    }

    #[test]
    fn label_selector_for_watch() {
	assert_eq!(ResourceFilter::new("app", None, None).label_selector().as_deref(), Some("app"));
	assert_eq!(ResourceFilter::new("app", Some("foo".to_string()), None).label_selector().as_deref(), Some("app=foo"));
	assert_eq!(ResourceFilter::new("app", None, Some(operator())).label_selector(), None);
    }
}
