// Trigger filter: decides whether an incoming event runs the workflow.

use glob::Pattern;

/// Events that always run the workflow regardless of the `on:` block.
const MANUAL_EVENTS: &[&str] = &["workflow_dispatch", "manual"];

/// One entry of the `on:` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTrigger {
    pub event: String,
    /// Branch patterns (`main`, `release/*`). Empty matches every branch.
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerFilter {
    /// Empty means the workflow did not declare `on:`; everything matches.
    pub triggers: Vec<EventTrigger>,
}

impl TriggerFilter {
    /// Parse the `on:` value: a single event name, a list of names, or a
    /// mapping of event name to `{ branches: [...] }`.
    pub fn from_yaml(value: Option<&serde_yaml::Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };

        let triggers = match value {
            serde_yaml::Value::String(event) => vec![EventTrigger {
                event: event.clone(),
                branches: Vec::new(),
            }],
            serde_yaml::Value::Sequence(events) => events
                .iter()
                .filter_map(|e| e.as_str())
                .map(|event| EventTrigger {
                    event: event.to_string(),
                    branches: Vec::new(),
                })
                .collect(),
            serde_yaml::Value::Mapping(map) => map
                .iter()
                .filter_map(|(k, v)| {
                    let event = k.as_str()?.to_string();
                    let branches = v
                        .get("branches")
                        .and_then(|b| b.as_sequence())
                        .map(|seq| {
                            seq.iter()
                                .filter_map(|b| b.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    Some(EventTrigger { event, branches })
                })
                .collect(),
            _ => Vec::new(),
        };

        Self { triggers }
    }

    /// Whether `event` on `branch` triggers the workflow.
    pub fn matches(&self, event: &str, branch: &str) -> bool {
        if self.triggers.is_empty() || MANUAL_EVENTS.contains(&event) {
            return true;
        }

        self.triggers
            .iter()
            .filter(|t| t.event == event)
            .any(|t| t.branches.is_empty() || t.branches.iter().any(|p| branch_matches(p, branch)))
    }
}

fn branch_matches(pattern: &str, branch: &str) -> bool {
    if pattern == branch {
        return true;
    }
    Pattern::new(pattern)
        .map(|p| p.matches(branch))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(yaml: &str) -> TriggerFilter {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        TriggerFilter::from_yaml(Some(&value))
    }

    #[test]
    fn push_and_pull_request_on_main() {
        let f = filter(
            "push:\n  branches: [main]\npull_request:\n  branches: [main]\n",
        );
        assert!(f.matches("push", "main"));
        assert!(f.matches("pull_request", "main"));
        assert!(!f.matches("push", "feature/x"));
        assert!(!f.matches("release", "main"));
    }

    #[test]
    fn manual_events_always_match() {
        let f = filter("push:\n  branches: [main]\n");
        assert!(f.matches("workflow_dispatch", "anything"));
        assert!(f.matches("manual", "dev"));
    }

    #[test]
    fn string_and_list_forms() {
        assert!(filter("push").matches("push", "dev"));
        let f = filter("[push, pull_request]");
        assert!(f.matches("pull_request", "dev"));
        assert!(!f.matches("schedule", "dev"));
    }

    #[test]
    fn branch_globs() {
        let f = filter("push:\n  branches: ['release/*']\n");
        assert!(f.matches("push", "release/1.2"));
        assert!(!f.matches("push", "main"));
    }

    #[test]
    fn missing_on_block_matches_everything() {
        let f = TriggerFilter::from_yaml(None);
        assert!(f.matches("push", "whatever"));
    }
}
