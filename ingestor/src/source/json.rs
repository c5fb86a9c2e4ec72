use super::{non_empty, parse_count, NormalizedPage, SourceFormat};
use ingestor_core::{Error, Result};
use serde_json::Value;

/// A JSON collection wrapped in a root object, e.g.
/// `{"dokumentlista": {"@traffar": "1200", "@nasta_sida": "...", "dokument": [...]}}`.
#[derive(Debug, Clone, Copy)]
pub struct JsonFormat {
    pub root: &'static str,
    pub item: &'static str,
    pub total_items: &'static str,
    pub total_pages: Option<&'static str>,
    pub next_page: Option<&'static str>,
}

impl SourceFormat for JsonFormat {
    fn name(&self) -> &'static str {
        "json"
    }

    fn parse(&self, body: &[u8]) -> Result<NormalizedPage> {
        let mut document: Value = serde_json::from_slice(body)?;

        let root = document
            .get_mut(self.root)
            .filter(|root| root.is_object())
            .ok_or_else(|| Error::Parse {
                format: "json",
                details: format!("missing root object '{}'", self.root),
            })?;

        // A one-hit result comes back as a bare object instead of an array.
        let items = match root.get_mut(self.item).map(Value::take) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(item) => vec![item],
        };

        let total_items = root.get(self.total_items).and_then(parse_count);
        let total_pages = self
            .total_pages
            .and_then(|key| root.get(key))
            .and_then(parse_count);
        let next_cursor = self
            .next_page
            .and_then(|key| root.get(key))
            .and_then(Value::as_str)
            .and_then(non_empty);

        Ok(NormalizedPage {
            items,
            total_items,
            total_pages,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const DOCUMENTS: JsonFormat = JsonFormat {
        root: "dokumentlista",
        item: "dokument",
        total_items: "@traffar",
        total_pages: Some("@sidor"),
        next_page: Some("@nasta_sida"),
    };

    #[test]
    fn parses_collection_with_next_link() {
        let body = json!({
            "dokumentlista": {
                "@traffar": "1200",
                "@sidor": "3",
                "@nasta_sida": "https://data.riksdagen.se/dokumentlista/?sz=500&p=2&utformat=json",
                "dokument": [
                    {"dok_id": "HB01FiU1", "titel": "Statens budget"},
                    {"dok_id": "HB01FiU2", "titel": "Ändringsbudget"}
                ]
            }
        });

        let page = DOCUMENTS.parse(body.to_string().as_bytes()).unwrap();

        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0]["dok_id"], "HB01FiU1");
        assert_eq!(page.total_items, Some(1200));
        assert_eq!(page.total_pages, Some(3));
        assert_eq!(
            page.next_cursor.as_deref(),
            Some("https://data.riksdagen.se/dokumentlista/?sz=500&p=2&utformat=json")
        );
    }

    #[test]
    fn single_object_becomes_one_item() {
        let body = json!({
            "dokumentlista": {
                "@traffar": 1,
                "dokument": {"dok_id": "HB01FiU1"}
            }
        });

        let page = DOCUMENTS.parse(body.to_string().as_bytes()).unwrap();

        assert_eq!(page.items, vec![json!({"dok_id": "HB01FiU1"})]);
        assert_eq!(page.total_items, Some(1));
        assert_eq!(page.total_pages, None);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn empty_result_and_blank_next_link() {
        let body = json!({
            "dokumentlista": {"@traffar": "0", "@nasta_sida": "  ", "dokument": null}
        });

        let page = DOCUMENTS.parse(body.to_string().as_bytes()).unwrap();

        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn missing_root_is_a_parse_error() {
        let err = DOCUMENTS.parse(br#"{"personlista": {}}"#).unwrap_err();
        assert!(matches!(err, Error::Parse { format: "json", .. }));

        let err = DOCUMENTS.parse(b"<html>busy</html>").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
