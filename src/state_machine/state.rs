use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PromotionError;

/// Name of a pipeline state, e.g. `pending` or `development`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(String);

impl StateId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A declared pipeline state.
///
/// Terminal states have no queue: an item promoted into one leaves every queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSpec {
    pub name: StateId,
    #[serde(default)]
    pub initial: bool,
    #[serde(default)]
    pub terminal: bool,
}

impl StateSpec {
    fn queued(name: &str) -> Self {
        Self {
            name: StateId::new(name),
            initial: false,
            terminal: false,
        }
    }
}

/// Shape a required evidence field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Non-empty string.
    Text,
    /// Non-empty array.
    List,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Text => write!(f, "non-empty text"),
            FieldKind::List => write!(f, "non-empty list"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    pub kind: FieldKind,
}

impl FieldRule {
    pub fn text(field: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: FieldKind::Text,
        }
    }

    pub fn list(field: &str) -> Self {
        Self {
            field: field.to_string(),
            kind: FieldKind::List,
        }
    }
}

/// A named, directed edge between two states with its evidence schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub name: String,
    pub from: StateId,
    pub to: StateId,
    #[serde(default)]
    pub required: Vec<FieldRule>,
}

impl TransitionSpec {
    pub fn new(name: &str, from: &str, to: &str, required: Vec<FieldRule>) -> Self {
        Self {
            name: name.to_string(),
            from: StateId::new(from),
            to: StateId::new(to),
            required,
        }
    }
}

/// The closed set of states and transitions the engine honors.
///
/// Built once at startup and validated up front; nothing is inferred at runtime.
#[derive(Debug, Clone)]
pub struct TransitionRegistry {
    states: Vec<StateSpec>,
    transitions: BTreeMap<String, TransitionSpec>,
    initial: StateId,
}

impl TransitionRegistry {
    pub fn new(
        states: Vec<StateSpec>,
        transitions: Vec<TransitionSpec>,
    ) -> Result<Self, PromotionError> {
        let mut seen = HashSet::new();
        for state in &states {
            if state.name.as_str().is_empty() {
                return Err(PromotionError::Config("state name must not be empty".into()));
            }
            if !seen.insert(state.name.clone()) {
                return Err(PromotionError::Config(format!(
                    "state `{}` declared twice",
                    state.name
                )));
            }
            if state.initial && state.terminal {
                return Err(PromotionError::Config(format!(
                    "state `{}` cannot be both initial and terminal",
                    state.name
                )));
            }
        }

        let initials: Vec<&StateSpec> = states.iter().filter(|s| s.initial).collect();
        let initial = match initials.as_slice() {
            [only] => only.name.clone(),
            [] => return Err(PromotionError::Config("no initial state declared".into())),
            _ => {
                return Err(PromotionError::Config(
                    "more than one initial state declared".into(),
                ));
            }
        };

        let mut table = BTreeMap::new();
        for transition in transitions {
            let from = states.iter().find(|s| s.name == transition.from);
            let Some(from) = from else {
                return Err(PromotionError::Config(format!(
                    "transition `{}` starts at undeclared state `{}`",
                    transition.name, transition.from
                )));
            };
            if from.terminal {
                return Err(PromotionError::Config(format!(
                    "transition `{}` starts at terminal state `{}`",
                    transition.name, transition.from
                )));
            }
            if !seen.contains(&transition.to) {
                return Err(PromotionError::Config(format!(
                    "transition `{}` ends at undeclared state `{}`",
                    transition.name, transition.to
                )));
            }
            let mut fields = HashSet::new();
            for rule in &transition.required {
                if !fields.insert(rule.field.as_str()) {
                    return Err(PromotionError::Config(format!(
                        "transition `{}` requires field `{}` twice",
                        transition.name, rule.field
                    )));
                }
            }
            let name = transition.name.clone();
            if table.insert(name.clone(), transition).is_some() {
                return Err(PromotionError::Config(format!(
                    "transition `{name}` declared twice"
                )));
            }
        }

        Ok(Self {
            states,
            transitions: table,
            initial,
        })
    }

    /// pending → development → integration → validation → complete, plus a
    /// rework edge from integration back to development.
    pub fn default_pipeline() -> Self {
        let states = vec![
            StateSpec {
                name: StateId::new("pending"),
                initial: true,
                terminal: false,
            },
            StateSpec::queued("development"),
            StateSpec::queued("integration"),
            StateSpec::queued("validation"),
            StateSpec {
                name: StateId::new("complete"),
                initial: false,
                terminal: true,
            },
        ];
        let transitions = vec![
            TransitionSpec::new(
                "pending_to_development",
                "pending",
                "development",
                vec![
                    FieldRule::text("requirements_analysis"),
                    FieldRule::list("acceptance_criteria"),
                ],
            ),
            TransitionSpec::new(
                "development_to_integration",
                "development",
                "integration",
                vec![
                    FieldRule::text("implementation_summary"),
                    FieldRule::list("files_changed"),
                ],
            ),
            TransitionSpec::new(
                "integration_to_validation",
                "integration",
                "validation",
                vec![
                    FieldRule::text("integration_report"),
                    FieldRule::list("tests_passed"),
                ],
            ),
            TransitionSpec::new(
                "validation_to_complete",
                "validation",
                "complete",
                vec![
                    FieldRule::text("validation_report"),
                    FieldRule::text("sign_off"),
                ],
            ),
            TransitionSpec::new(
                "integration_to_development",
                "integration",
                "development",
                vec![FieldRule::text("rework_reason")],
            ),
        ];

        // The literal table above is known-good.
        match Self::new(states, transitions) {
            Ok(registry) => registry,
            Err(e) => unreachable!("default pipeline is invalid: {e}"),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<&TransitionSpec, PromotionError> {
        self.transitions
            .get(name)
            .ok_or_else(|| PromotionError::UnknownTransition(name.to_string()))
    }

    pub fn initial_state(&self) -> &StateId {
        &self.initial
    }

    pub fn state(&self, name: &StateId) -> Option<&StateSpec> {
        self.states.iter().find(|s| &s.name == name)
    }

    /// Whether items in this state sit in a queue.
    pub fn is_queued(&self, name: &StateId) -> bool {
        self.state(name).is_some_and(|s| !s.terminal)
    }

    pub fn states(&self) -> &[StateSpec] {
        &self.states
    }

    pub fn queued_states(&self) -> impl Iterator<Item = &StateId> {
        self.states.iter().filter(|s| !s.terminal).map(|s| &s.name)
    }

    /// Transitions in name order.
    pub fn transitions(&self) -> impl Iterator<Item = &TransitionSpec> {
        self.transitions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states() -> Vec<StateSpec> {
        vec![
            StateSpec {
                name: StateId::new("todo"),
                initial: true,
                terminal: false,
            },
            StateSpec {
                name: StateId::new("done"),
                initial: false,
                terminal: true,
            },
        ]
    }

    #[test]
    fn default_pipeline_resolves_every_edge() {
        let registry = TransitionRegistry::default_pipeline();
        assert_eq!(registry.initial_state().as_str(), "pending");
        assert_eq!(registry.transitions().count(), 5);

        let t = registry.resolve("pending_to_development").unwrap();
        assert_eq!(t.from.as_str(), "pending");
        assert_eq!(t.to.as_str(), "development");
        assert_eq!(
            t.required,
            vec![
                FieldRule::text("requirements_analysis"),
                FieldRule::list("acceptance_criteria"),
            ]
        );
    }

    #[test]
    fn unknown_transition_is_rejected() {
        let registry = TransitionRegistry::default_pipeline();
        let err = registry.resolve("pending_to_complete").unwrap_err();
        assert!(matches!(err, PromotionError::UnknownTransition(name) if name == "pending_to_complete"));
    }

    #[test]
    fn terminal_state_is_not_queued() {
        let registry = TransitionRegistry::default_pipeline();
        assert!(registry.is_queued(&StateId::new("validation")));
        assert!(!registry.is_queued(&StateId::new("complete")));
        assert!(!registry.is_queued(&StateId::new("nowhere")));
        assert_eq!(registry.queued_states().count(), 4);
    }

    #[test]
    fn rework_cycle_is_allowed() {
        let registry = TransitionRegistry::default_pipeline();
        let rework = registry.resolve("integration_to_development").unwrap();
        let forward = registry.resolve("development_to_integration").unwrap();
        assert_eq!(rework.from, forward.to);
        assert_eq!(rework.to, forward.from);
    }

    #[test]
    fn rejects_edge_to_undeclared_state() {
        let err = TransitionRegistry::new(
            states(),
            vec![TransitionSpec::new("todo_to_review", "todo", "review", vec![])],
        )
        .unwrap_err();
        assert!(matches!(err, PromotionError::Config(msg) if msg.contains("review")));
    }

    #[test]
    fn rejects_edge_out_of_terminal_state() {
        let err = TransitionRegistry::new(
            states(),
            vec![TransitionSpec::new("reopen", "done", "todo", vec![])],
        )
        .unwrap_err();
        assert!(matches!(err, PromotionError::Config(msg) if msg.contains("terminal")));
    }

    #[test]
    fn requires_exactly_one_initial_state() {
        let mut none = states();
        none[0].initial = false;
        assert!(TransitionRegistry::new(none, vec![]).is_err());

        let mut two = states();
        two.push(StateSpec {
            name: StateId::new("backlog"),
            initial: true,
            terminal: false,
        });
        assert!(TransitionRegistry::new(two, vec![]).is_err());
    }

    #[test]
    fn rejects_duplicate_transition_and_field() {
        let t = TransitionSpec::new("finish", "todo", "done", vec![]);
        assert!(TransitionRegistry::new(states(), vec![t.clone(), t]).is_err());

        let dup_field = TransitionSpec::new(
            "finish",
            "todo",
            "done",
            vec![FieldRule::text("note"), FieldRule::list("note")],
        );
        assert!(TransitionRegistry::new(states(), vec![dup_field]).is_err());
    }

    #[test]
    fn state_display() {
        assert_eq!(StateId::new("integration").to_string(), "integration");
        assert_eq!(FieldKind::List.to_string(), "non-empty list");
    }
}
