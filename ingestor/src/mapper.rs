//! One mapping function per data type, selected through [`mapper_for`].
//!
//! Mappers read the source vocabulary (Riksdagen's Swedish field names,
//! Regeringen's list items) and produce a flat record keyed by the natural id
//! of the target table. Absent fields are left out rather than written as
//! null so that a later upsert never erases data a fuller payload supplied.

use crate::model::{Attachment, DataType, MappedRecord, RawItem};
use chrono::NaiveDate;
use ingestor_core::{Error, Result};
use serde_json::{Map, Value};

pub type MapFn = fn(&RawItem) -> Result<MappedRecord>;

pub fn mapper_for(data_type: DataType) -> MapFn {
    match data_type {
        DataType::Documents => map_document,
        DataType::Members => map_member,
        DataType::Speeches => map_speech,
        DataType::Votes => map_vote,
        DataType::PressReleases => map_press_release,
        DataType::CategorizedDocuments => map_categorized_document,
    }
}

fn text(item: &RawItem, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn integer(item: &RawItem, key: &str) -> Option<i64> {
    match item.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Leading `YYYY-MM-DD` of a date or timestamp string.
fn date(item: &RawItem, key: &str) -> Option<String> {
    let raw = text(item, key)?;
    let prefix = raw.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d")
        .ok()
        .map(|d| d.format("%Y-%m-%d").to_string())
}

fn required(item: &RawItem, key: &str, data_type: DataType) -> Result<String> {
    text(item, key).ok_or_else(|| Error::Mapping {
        data_type: data_type.to_string(),
        details: format!("missing '{key}'"),
    })
}

/// Values that are a single object or an array of objects.
fn each<'a>(value: Option<&'a Value>) -> Vec<&'a Value> {
    match value {
        Some(Value::Array(values)) => values.iter().collect(),
        Some(value @ Value::Object(_)) => vec![value],
        _ => Vec::new(),
    }
}

fn file_name_of(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("file")
        .to_string()
}

struct RecordBuilder {
    fields: Map<String, Value>,
}

impl RecordBuilder {
    fn new(key_column: &str, key: &str) -> Self {
        let mut fields = Map::new();
        fields.insert(key_column.to_string(), Value::String(key.to_string()));
        Self { fields }
    }

    fn text(mut self, column: &str, value: Option<String>) -> Self {
        if let Some(value) = value {
            self.fields.insert(column.to_string(), Value::String(value));
        }
        self
    }

    fn integer(mut self, column: &str, value: Option<i64>) -> Self {
        if let Some(value) = value {
            self.fields.insert(column.to_string(), Value::from(value));
        }
        self
    }

    fn build(self, natural_key: String, attachments: Vec<Attachment>) -> MappedRecord {
        MappedRecord {
            natural_key,
            fields: self.fields,
            attachments,
        }
    }
}

pub fn map_document(item: &RawItem) -> Result<MappedRecord> {
    let dok_id = required(item, "dok_id", DataType::Documents)?;

    let attachments = each(item.get("filbilaga").and_then(|f| f.get("fil")))
        .into_iter()
        .filter_map(|file| {
            let url = text(file, "url")?;
            let file_name = text(file, "namn").unwrap_or_else(|| file_name_of(&url));
            Some(Attachment {
                url,
                file_name,
                column: "file_storage_path",
            })
        })
        .collect();

    Ok(RecordBuilder::new("dok_id", &dok_id)
        .text("rm", text(item, "rm"))
        .text("beteckning", text(item, "beteckning"))
        .text("doktyp", text(item, "doktyp"))
        .text("typ", text(item, "typ"))
        .text("subtyp", text(item, "subtyp"))
        .text("titel", text(item, "titel"))
        .text("undertitel", text(item, "undertitel"))
        .text("organ", text(item, "organ"))
        .text("status", text(item, "status"))
        .text("summary", text(item, "summary"))
        .text("datum", date(item, "datum"))
        .text("publicerad", text(item, "publicerad"))
        .text("dokument_url_html", text(item, "dokument_url_html"))
        .text("dokument_url_text", text(item, "dokument_url_text"))
        .build(dok_id, attachments))
}

pub fn map_member(item: &RawItem) -> Result<MappedRecord> {
    let intressent_id = required(item, "intressent_id", DataType::Members)?;

    let first = text(item, "tilltalsnamn");
    let last = text(item, "efternamn");
    let full_name = match (&first, &last) {
        (Some(first), Some(last)) => Some(format!("{first} {last}")),
        (Some(name), None) | (None, Some(name)) => Some(name.clone()),
        (None, None) => None,
    };

    let attachments = text(item, "bild_url_max")
        .map(|url| Attachment {
            file_name: file_name_of(&url),
            url,
            column: "image_storage_path",
        })
        .into_iter()
        .collect();

    Ok(RecordBuilder::new("intressent_id", &intressent_id)
        .text("tilltalsnamn", first)
        .text("efternamn", last)
        .text("full_name", full_name)
        .text("sorteringsnamn", text(item, "sorteringsnamn"))
        .text("parti", text(item, "parti"))
        .text("valkrets", text(item, "valkrets"))
        .text("status", text(item, "status"))
        .text("kon", text(item, "kon"))
        .integer("fodd_ar", integer(item, "fodd_ar"))
        .text("bild_url", text(item, "bild_url_max"))
        .build(intressent_id, attachments))
}

pub fn map_speech(item: &RawItem) -> Result<MappedRecord> {
    let anforande_id = required(item, "anforande_id", DataType::Speeches)?;

    Ok(RecordBuilder::new("anforande_id", &anforande_id)
        .text("dok_id", text(item, "dok_id"))
        .text("dok_rm", text(item, "dok_rm"))
        .text("dok_titel", text(item, "dok_titel"))
        .text("dok_datum", date(item, "dok_datum"))
        .text("avsnittsrubrik", text(item, "avsnittsrubrik"))
        .text("kammaraktivitet", text(item, "kammaraktivitet"))
        .text("talare", text(item, "talare"))
        .text("parti", text(item, "parti"))
        .text("intressent_id", text(item, "intressent_id"))
        .integer("anforande_nummer", integer(item, "anforande_nummer"))
        .text("anforandetext", text(item, "anforandetext"))
        .text("anforande_url_html", text(item, "anforande_url_html"))
        .build(anforande_id, Vec::new()))
}

pub fn map_vote(item: &RawItem) -> Result<MappedRecord> {
    let votering_id = required(item, "votering_id", DataType::Votes)?;

    Ok(RecordBuilder::new("votering_id", &votering_id)
        .text("rm", text(item, "rm"))
        .text("beteckning", text(item, "beteckning"))
        .integer("punkt", integer(item, "punkt"))
        .text("avser", text(item, "avser"))
        .integer("ja", integer(item, "Ja"))
        .integer("nej", integer(item, "Nej"))
        .integer("franvarande", integer(item, "Frånvarande"))
        .integer("avstar", integer(item, "Avstår"))
        .text("datum", date(item, "systemdatum"))
        .build(votering_id, Vec::new()))
}

/// Regeringen items carry an `id`; older ones only a site path, which is
/// stable enough to serve as the key.
fn government_document_id(item: &RawItem, data_type: DataType) -> Result<String> {
    if let Some(id) = text(item, "id") {
        return Ok(id);
    }
    let url = required(item, "url", data_type)?;
    let path = match url.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map_or("", |(_, path)| path),
        None => url.as_str(),
    };
    let key = path
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if key.is_empty() {
        return Err(Error::Mapping {
            data_type: data_type.to_string(),
            details: format!("cannot derive id from url '{url}'"),
        });
    }
    Ok(key)
}

fn government_attachments(item: &RawItem) -> Vec<Attachment> {
    each(item.get("attachments").and_then(|a| a.get("attachment")))
        .into_iter()
        .filter_map(|attachment| {
            let url = text(attachment, "url")?;
            let file_name = text(attachment, "name").unwrap_or_else(|| file_name_of(&url));
            Some(Attachment {
                url,
                file_name,
                column: "file_storage_path",
            })
        })
        .collect()
}

fn government_record(item: &RawItem, data_type: DataType) -> Result<(String, RecordBuilder)> {
    let document_id = government_document_id(item, data_type)?;
    let title = required(item, "title", data_type)?;

    let builder = RecordBuilder::new("document_id", &document_id)
        .text("title", Some(title))
        .text("summary", text(item, "summary").or_else(|| text(item, "preamble")))
        .text("published", date(item, "published"))
        .text("updated", date(item, "updated"))
        .text("department", text(item, "department"))
        .text("url", text(item, "url"));
    Ok((document_id, builder))
}

pub fn map_press_release(item: &RawItem) -> Result<MappedRecord> {
    let (document_id, builder) = government_record(item, DataType::PressReleases)?;
    Ok(builder.build(document_id, government_attachments(item)))
}

pub fn map_categorized_document(item: &RawItem) -> Result<MappedRecord> {
    let (document_id, builder) = government_record(item, DataType::CategorizedDocuments)?;
    let category = text(item, "category").or_else(|| text(item, "type"));
    Ok(builder
        .text("category", category)
        .build(document_id, government_attachments(item)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn maps_document_with_attachments() {
        let item = json!({
            "dok_id": "HB01FiU1",
            "rm": "2023/24",
            "beteckning": "FiU1",
            "doktyp": "bet",
            "titel": "Statens budget 2024",
            "datum": "2023-11-21 00:00:00",
            "undertitel": "",
            "filbilaga": {
                "fil": {
                    "typ": "pdf",
                    "namn": "20231121_FiU1.pdf",
                    "url": "https://data.riksdagen.se/fil/ABC123"
                }
            }
        });

        let record = mapper_for(DataType::Documents)(&item).unwrap();

        assert_eq!(record.natural_key, "HB01FiU1");
        assert_eq!(record.fields["datum"], "2023-11-21");
        assert!(!record.fields.contains_key("undertitel"));
        assert_eq!(
            record.attachments,
            vec![Attachment {
                url: "https://data.riksdagen.se/fil/ABC123".into(),
                file_name: "20231121_FiU1.pdf".into(),
                column: "file_storage_path",
            }]
        );
    }

    #[test]
    fn maps_member_and_names() {
        let item = json!({
            "intressent_id": "0980681605721",
            "tilltalsnamn": "Magdalena",
            "efternamn": "Andersson",
            "parti": "S",
            "fodd_ar": "1967",
            "bild_url_max": "https://data.riksdagen.se/filarkiv/bilder/ledamot/abc_max.jpg"
        });

        let record = map_member(&item).unwrap();

        assert_eq!(record.fields["full_name"], "Magdalena Andersson");
        assert_eq!(record.fields["fodd_ar"], 1967);
        assert_eq!(record.attachments[0].file_name, "abc_max.jpg");
        assert_eq!(record.attachments[0].column, "image_storage_path");
    }

    #[test]
    fn maps_vote_counts() {
        let item = json!({
            "votering_id": "2F0C2E9C-1A2B",
            "rm": "2023/24",
            "punkt": "1",
            "Ja": "175",
            "Nej": 120,
            "Frånvarande": "54",
            "Avstår": "0",
            "systemdatum": "2023-11-22 15:31:22"
        });

        let record = map_vote(&item).unwrap();

        assert_eq!(record.natural_key, "2F0C2E9C-1A2B");
        assert_eq!(record.fields["ja"], 175);
        assert_eq!(record.fields["nej"], 120);
        assert_eq!(record.fields["franvarande"], 54);
        assert_eq!(record.fields["datum"], "2023-11-22");
    }

    #[test]
    fn derives_government_id_from_url() {
        let item = json!({
            "title": "Ny strategi",
            "url": "/pressmeddelanden/2024/01/ny-strategi/",
            "attachments": {"attachment": [{"url": "/contentassets/x/strategi.pdf"}]}
        });

        let record = map_press_release(&item).unwrap();

        assert_eq!(record.natural_key, "pressmeddelanden-2024-01-ny-strategi");
        assert_eq!(record.fields["document_id"], "pressmeddelanden-2024-01-ny-strategi");
        assert_eq!(record.attachments[0].file_name, "strategi.pdf");
    }

    #[test]
    fn categorized_documents_keep_category() {
        let item = json!({"id": "rap-1", "title": "Rapport", "type": "rapporter"});

        let record = map_categorized_document(&item).unwrap();

        assert_eq!(record.fields["category"], "rapporter");
    }

    #[test]
    fn missing_natural_key_is_a_mapping_error() {
        let err = map_speech(&json!({"talare": "Talmannen"})).unwrap_err();
        assert!(matches!(err, Error::Mapping { .. }));

        let err = map_press_release(&json!({"id": "x"})).unwrap_err();
        assert!(matches!(err, Error::Mapping { .. }));
    }
}
