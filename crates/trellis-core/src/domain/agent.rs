//! Agent record (a document of the `agents` kind).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Available,
    Unavailable,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub skills: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
}

/// Creation payload accepted by `POST collection(agents)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewAgent {
    #[serde(default)]
    pub id: Option<String>,
    pub role: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub skills: BTreeSet<String>,
}

impl Agent {
    pub fn from_new(id: String, new: NewAgent, now: DateTime<Utc>) -> Self {
        Self {
            id,
            role: new.role,
            status: new.status,
            skills: new.skills,
            last_seen: now,
        }
    }

    pub fn has_skill(&self, skill: &str) -> bool {
        self.skills.contains(skill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_agent_defaults_to_available() {
        let new: NewAgent =
            serde_json::from_value(json!({"role": "builder", "skills": ["rust"]})).unwrap();
        let agent = Agent::from_new("agent-1".into(), new, Utc::now());
        assert_eq!(agent.status, AgentStatus::Available);
        assert!(agent.has_skill("rust"));
        assert!(!agent.has_skill("go"));
    }

    #[test]
    fn status_uses_snake_case() {
        assert_eq!(serde_json::to_value(AgentStatus::Busy).unwrap(), json!("busy"));
        assert!(serde_json::from_value::<AgentStatus>(json!("asleep")).is_err());
    }
}
