use std::{collections::HashMap, path::Path};

use async_trait::async_trait;

use crate::{
    domain::SenderId,
    ports::{ProfileStore, UserProfile},
    Result,
};

pub const NEW_USER_CONTEXT: &str = "新用戶：尚未設定持有的信用卡。";

/// Profiles read once from a JSON object `{ "<sender>": { "wallet": [...], "paymentBindings": {...} } }`.
#[derive(Clone, Debug, Default)]
pub struct JsonProfileStore {
    profiles: HashMap<String, UserProfile>,
}

impl JsonProfileStore {
    pub fn load(path: &Path) -> Result<Self> {
        let txt = std::fs::read_to_string(path)?;
        Self::from_json(&txt)
    }

    pub fn from_json(txt: &str) -> Result<Self> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(Self {
            profiles: serde_json::from_str(txt)?,
        })
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl ProfileStore for JsonProfileStore {
    async fn lookup(&self, sender: &SenderId) -> Result<Option<UserProfile>> {
        Ok(self.profiles.get(sender.as_str()).cloned())
    }
}

/// Render a profile into the context text injected into the gateway prompt.
pub fn build_user_context(profile: Option<&UserProfile>) -> String {
    let Some(p) = profile.filter(|p| !p.wallet.is_empty() || !p.payment_bindings.is_empty())
    else {
        return NEW_USER_CONTEXT.to_string();
    };

    let mut lines = Vec::new();
    if p.wallet.is_empty() {
        lines.push("持有卡片：未設定".to_string());
    } else {
        lines.push("持有卡片：".to_string());
        for c in &p.wallet {
            match &c.note {
                Some(note) if !note.trim().is_empty() => {
                    lines.push(format!("- {} {}（{}）", c.bank, c.name, note.trim()))
                }
                _ => lines.push(format!("- {} {}", c.bank, c.name)),
            }
        }
    }

    if !p.payment_bindings.is_empty() {
        lines.push("支付綁定：".to_string());
        for (method, card) in &p.payment_bindings {
            lines.push(format!("- {method} → {card}"));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILES: &str = r#"{
      "U1": {
        "wallet": [
          {"bank": "國泰世華", "name": "CUBE卡"},
          {"bank": "台新", "name": "Richart卡", "note": "天天刷方案"}
        ],
        "paymentBindings": {"LINE Pay": "CUBE卡"}
      },
      "U2": {}
    }"#;

    #[tokio::test]
    async fn lookup_returns_known_profiles_only() {
        let store = JsonProfileStore::from_json(PROFILES).unwrap();
        assert_eq!(store.len(), 2);

        let p = store.lookup(&SenderId::new("U1")).await.unwrap().unwrap();
        assert_eq!(p.wallet.len(), 2);
        assert_eq!(p.payment_bindings["LINE Pay"], "CUBE卡");

        assert!(store.lookup(&SenderId::new("nobody")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn context_lists_cards_and_bindings() {
        let store = JsonProfileStore::from_json(PROFILES).unwrap();
        let p = store.lookup(&SenderId::new("U1")).await.unwrap();
        let ctx = build_user_context(p.as_ref());
        assert!(ctx.contains("- 國泰世華 CUBE卡"));
        assert!(ctx.contains("- 台新 Richart卡（天天刷方案）"));
        assert!(ctx.contains("- LINE Pay → CUBE卡"));
    }

    #[tokio::test]
    async fn absent_or_empty_profile_is_new_user() {
        assert_eq!(build_user_context(None), NEW_USER_CONTEXT);
        let store = JsonProfileStore::from_json(PROFILES).unwrap();
        let empty = store.lookup(&SenderId::new("U2")).await.unwrap();
        assert_eq!(build_user_context(empty.as_ref()), NEW_USER_CONTEXT);
    }
}
