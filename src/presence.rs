//! Presence channel membership.

use indexmap::IndexMap;
use serde_json::Value;

/// A participant on a presence channel
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: String,
    pub info: Value,
}

impl Member {
    pub fn new(id: impl Into<String>, info: Value) -> Self {
        Self {
            id: id.into(),
            info,
        }
    }

    /// Parse a `pusher:member_added` payload
    pub fn from_event_data(data: &Value) -> Option<Self> {
        Some(Self {
            id: member_id(data)?,
            info: data.get("user_info").cloned().unwrap_or(Value::Null),
        })
    }
}

/// Extract the member id from `user_id` or `id`, accepting numeric ids
pub fn member_id(data: &Value) -> Option<String> {
    let id = data.get("user_id").or_else(|| data.get("id"))?;
    match id {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// The member set of one presence channel, in join order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Members {
    members: IndexMap<String, Member>,
}

impl Members {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a member. Returns `true` if the id was new.
    pub fn upsert(&mut self, member: Member) -> bool {
        self.members.insert(member.id.clone(), member).is_none()
    }

    pub fn remove(&mut self, id: &str) -> Option<Member> {
        self.members.shift_remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    /// Replace the set with the roster carried by `pusher:subscription_succeeded`:
    /// `{"presence": {"ids": [...], "hash": {id: info}, "count": n}}`
    pub fn load_roster(&mut self, data: &Value) {
        self.members.clear();
        let Some(presence) = data.get("presence") else {
            return;
        };
        let hash = presence.get("hash").and_then(Value::as_object);

        if let Some(ids) = presence.get("ids").and_then(Value::as_array) {
            for id in ids {
                let id = match id {
                    Value::String(id) => id.clone(),
                    Value::Number(id) => id.to_string(),
                    _ => continue,
                };
                let info = hash
                    .and_then(|hash| hash.get(&id))
                    .cloned()
                    .unwrap_or(Value::Null);
                self.upsert(Member::new(id, info));
            }
        } else if let Some(hash) = hash {
            for (id, info) in hash {
                self.upsert(Member::new(id.clone(), info.clone()));
            }
        }
    }
}
