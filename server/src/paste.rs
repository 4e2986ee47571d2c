use chrono::{DateTime, Utc};
use ephemeral_paste_common::PasteView;
use serde::{Deserialize, Serialize};

use crate::expiry;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PasteRecord {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_views: Option<u32>,
    pub view_count: u32,
}

impl PasteRecord {
    pub fn new(
        id: String,
        content: String,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        max_views: Option<u32>,
    ) -> Self {
        Self {
            id,
            content,
            created_at,
            expires_at,
            max_views,
            view_count: 0,
        }
    }

    pub fn to_view(&self) -> PasteView {
        PasteView {
            content: self.content.clone(),
            remaining_views: expiry::remaining_views(self),
            expires_at: self.expires_at,
        }
    }
}

pub fn storage_key(id: &str) -> String {
    format!("paste:{id}")
}

pub fn encode(record: &PasteRecord) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(record)
}

pub fn decode(bytes: &[u8]) -> Result<PasteRecord, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn content_survives_encoding_byte_for_byte() {
        let content = "line one\r\n\ttab\0nul\u{1b}[31mred\u{7f} ✓".to_owned();
        let record = PasteRecord::new(
            "abc".to_owned(),
            content.clone(),
            Utc.timestamp(1_700_000_000, 0),
            None,
            Some(2),
        );
        let decoded = decode(&encode(&record).unwrap()).unwrap();
        assert_eq!(decoded.content.as_bytes(), content.as_bytes());
        assert_eq!(decoded, record);
    }

    #[test]
    fn view_reports_remaining_views() {
        let mut record = PasteRecord::new(
            "abc".to_owned(),
            "hi".to_owned(),
            Utc.timestamp(1_700_000_000, 0),
            None,
            Some(3),
        );
        record.view_count = 1;
        let view = record.to_view();
        assert_eq!(view.remaining_views, Some(2));
        assert_eq!(view.expires_at, None);
        assert_eq!(view.content, "hi");
    }
}
