use std::{collections::BTreeMap, sync::Arc};

use crate::{ports::PropertyStore, Result};

/// Remote document id -> canonical display name.
pub type CorrespondenceMap = BTreeMap<String, String>;

pub const NAME_MAP_KEY: &str = "DOC_NAME_MAP";

/// Durable correspondence map. Reads and writes always cover the full map.
pub struct CorrespondenceStore {
    props: Arc<dyn PropertyStore>,
    key: String,
}

impl CorrespondenceStore {
    pub fn new(props: Arc<dyn PropertyStore>) -> Self {
        Self {
            props,
            key: NAME_MAP_KEY.to_string(),
        }
    }

    pub async fn load(&self) -> Result<CorrespondenceMap> {
        match self.props.get(&self.key).await? {
            Some(txt) if !txt.trim().is_empty() => Ok(serde_json::from_str(&txt)?),
            _ => Ok(CorrespondenceMap::new()),
        }
    }

    pub async fn save(&self, map: &CorrespondenceMap) -> Result<()> {
        let txt = serde_json::to_string(map)?;
        self.props.set(&self.key, &txt).await
    }
}
