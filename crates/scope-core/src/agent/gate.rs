//! Confirmation gate
//!
//! `Idle -> FormShown -> Confirmed`, owned by the server and persisted per
//! conversation. A form shown in one turn can only be confirmed by the
//! next user message, so no write can run in the turn that showed it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::{Database, PendingWriteStore};
use crate::tools::{Capability, ToolKind, UiDescriptor, WriteGuard};

/// Prefix of a user message that confirms the shown form.
pub const CONFIRMATION_PREFIX: &str = "CONFIRMED:";

/// A write awaiting confirmation, with its prefilled field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub capability: Capability,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl PendingWrite {
    /// Read the write a `form` descriptor proposes. Forms naming anything
    /// other than a write capability propose nothing.
    pub fn from_form(ui: &UiDescriptor) -> Option<Self> {
        let capability = Capability::from_name(ui.form_action()?)?;
        if capability.kind() != ToolKind::Write {
            return None;
        }
        let fields = ui
            .props
            .get("fields")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|field| {
                let name = field.get("name")?.as_str()?;
                Some((name.to_string(), field.get("value").cloned().unwrap_or(Value::Null)))
            })
            .collect();
        Some(Self { capability, fields })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    #[default]
    Idle,
    FormShown { pending: Vec<PendingWrite> },
    Confirmed { authorized: Vec<PendingWrite> },
}

impl GateState {
    pub fn label(&self) -> &'static str {
        match self {
            GateState::Idle => "idle",
            GateState::FormShown { .. } => "form_shown",
            GateState::Confirmed { .. } => "confirmed",
        }
    }

    /// Transition on a new user message. Only `FormShown` followed by a
    /// confirmation reaches `Confirmed`; every other message abandons.
    pub fn on_user_message(self, message: &str) -> GateState {
        match (self, parse_confirmation(message)) {
            (GateState::FormShown { mut pending }, Some(overrides)) => {
                apply_overrides(&mut pending, &overrides);
                tracing::info!(actions = pending.len(), "Pending writes confirmed");
                GateState::Confirmed { authorized: pending }
            }
            (GateState::FormShown { pending }, None) => {
                tracing::info!(actions = pending.len(), "Pending writes abandoned");
                GateState::Idle
            }
            _ => GateState::Idle,
        }
    }

    pub fn load(db: &Database, conversation_id: &str) -> anyhow::Result<Self> {
        Ok(PendingWriteStore::new(db)
            .load(conversation_id)?
            .unwrap_or_default())
    }

    pub fn save(&self, db: &Database, conversation_id: &str) -> anyhow::Result<()> {
        let store = PendingWriteStore::new(db);
        match self {
            GateState::Idle => store.clear(conversation_id),
            state => store.save(conversation_id, state.label(), state),
        }
    }
}

/// `key: value` lines after the prefix, or `None` if not a confirmation.
pub fn parse_confirmation(message: &str) -> Option<Map<String, Value>> {
    let rest = message.strip_prefix(CONFIRMATION_PREFIX)?;
    Some(
        rest.lines()
            .filter_map(|line| {
                let (key, value) = line.split_once(':')?;
                let key = key.trim();
                if key.is_empty() || key.contains(char::is_whitespace) {
                    return None;
                }
                Some((key.to_string(), Value::String(value.trim().to_string())))
            })
            .collect(),
    )
}

/// A lone pending write takes every override. With several, each takes
/// only the keys it already has.
fn apply_overrides(pending: &mut [PendingWrite], overrides: &Map<String, Value>) {
    let single = pending.len() == 1;
    for write in pending.iter_mut() {
        for (key, value) in overrides {
            if single || write.fields.contains_key(key) {
                write.fields.insert(key.clone(), value.clone());
            }
        }
    }
}

/// The gate for one running turn.
#[derive(Debug, Default)]
pub struct WriteGate {
    state: Mutex<GateState>,
}

impl WriteGate {
    pub fn new(state: GateState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Authorizations still available in this turn.
    pub fn authorized(&self) -> Vec<PendingWrite> {
        match &*self.state.lock() {
            GateState::Confirmed { authorized } => authorized.clone(),
            _ => Vec::new(),
        }
    }

    /// Record writes proposed by a form. Any confirmation left in this
    /// turn is dropped.
    pub fn form_shown(&self, proposed: Vec<PendingWrite>) {
        if proposed.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let mut pending = match std::mem::take(&mut *state) {
            GateState::FormShown { pending } => pending,
            GateState::Idle | GateState::Confirmed { .. } => Vec::new(),
        };
        pending.extend(proposed);
        *state = GateState::FormShown { pending };
    }

    pub fn has_pending_form(&self) -> bool {
        matches!(&*self.state.lock(), GateState::FormShown { .. })
    }

    /// State to persist at turn end. Unused authorizations are discarded.
    pub fn finish(&self) -> GateState {
        match std::mem::take(&mut *self.state.lock()) {
            GateState::Confirmed { authorized } => {
                if !authorized.is_empty() {
                    tracing::info!(unused = authorized.len(), "Discarding unused write authorizations");
                }
                GateState::Idle
            }
            other => other,
        }
    }
}

impl WriteGuard for WriteGate {
    fn authorize(&self, capability: Capability) -> Option<Map<String, Value>> {
        let mut state = self.state.lock();
        let GateState::Confirmed { authorized } = &mut *state else {
            return None;
        };
        let index = authorized.iter().position(|w| w.capability == capability)?;
        Some(authorized.remove(index).fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn form(action: &str) -> UiDescriptor {
        UiDescriptor::new(
            "form",
            json!({
                "title": "Create issue",
                "action": action,
                "fields": [
                    {"name": "repo", "label": "Repo", "value": "acme/api"},
                    {"name": "title", "label": "Title", "value": "Crash"}
                ]
            }),
        )
    }

    fn shown() -> GateState {
        GateState::FormShown {
            pending: vec![PendingWrite::from_form(&form("create_github_issue")).unwrap()],
        }
    }

    #[test]
    fn test_form_for_non_write_proposes_nothing() {
        assert!(PendingWrite::from_form(&form("search_signals")).is_none());
        assert!(PendingWrite::from_form(&form("rm_rf")).is_none());
        let not_form = UiDescriptor::new("signal_list", json!({"action": "create_github_issue"}));
        assert!(PendingWrite::from_form(&not_form).is_none());
    }

    #[test]
    fn test_confirmation_applies_edits() {
        let state = shown().on_user_message("CONFIRMED:\ntitle: Safari crash on checkout\n");
        let GateState::Confirmed { authorized } = state else {
            panic!("expected confirmed");
        };
        assert_eq!(authorized[0].fields["title"], "Safari crash on checkout");
        assert_eq!(authorized[0].fields["repo"], "acme/api");
    }

    #[test]
    fn test_other_messages_abandon() {
        assert_eq!(shown().on_user_message("actually, never mind"), GateState::Idle);
        assert_eq!(shown().on_user_message("confirmed: lowercase"), GateState::Idle);
        assert_eq!(GateState::Idle.on_user_message("CONFIRMED:"), GateState::Idle);
        let confirmed = shown().on_user_message("CONFIRMED:");
        assert_eq!(confirmed.on_user_message("CONFIRMED:"), GateState::Idle);
    }

    #[test]
    fn test_each_authorization_is_single_use() {
        let gate = WriteGate::new(shown().on_user_message("CONFIRMED:"));
        assert!(gate.authorize(Capability::PostSlackMessage).is_none());
        assert!(gate.authorize(Capability::CreateGithubIssue).is_some());
        assert!(gate.authorize(Capability::CreateGithubIssue).is_none());
        assert_eq!(gate.finish(), GateState::Idle);
    }

    #[test]
    fn test_form_in_turn_blocks_until_next_message() {
        let gate = WriteGate::new(GateState::Idle);
        gate.form_shown(vec![PendingWrite::from_form(&form("create_github_issue")).unwrap()]);
        assert!(gate.has_pending_form());
        assert!(gate.authorize(Capability::CreateGithubIssue).is_none());
        assert_eq!(gate.finish().label(), "form_shown");
    }

    #[test]
    fn test_overrides_with_several_pending() {
        let mut pending = vec![
            PendingWrite {
                capability: Capability::PostSlackMessage,
                fields: Map::from_iter([("text".to_string(), json!("old"))]),
            },
            PendingWrite {
                capability: Capability::CreateGithubIssue,
                fields: Map::from_iter([("title".to_string(), json!("old"))]),
            },
        ];
        apply_overrides(&mut pending, &parse_confirmation("CONFIRMED:\ntext: new").unwrap());
        assert_eq!(pending[0].fields["text"], "new");
        assert!(!pending[1].fields.contains_key("text"));
    }

    #[test]
    fn test_state_persists_per_conversation() {
        let db = Database::in_memory().unwrap();
        shown().save(&db, "conv-1").unwrap();
        assert_eq!(GateState::load(&db, "conv-1").unwrap(), shown());
        assert_eq!(GateState::load(&db, "conv-2").unwrap(), GateState::Idle);
        GateState::Idle.save(&db, "conv-1").unwrap();
        assert_eq!(GateState::load(&db, "conv-1").unwrap(), GateState::Idle);
    }
}
