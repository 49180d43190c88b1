//! MARCXML record parsing
//!
//! Parses one `<record>` element into control fields and data fields. Only
//! the structure is interpreted here; field semantics belong to converters.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Parse failure: the raw bytes are not a usable legacy record
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarcXmlError {
    #[error("malformed MARCXML: {0}")]
    Xml(String),

    #[error("no <record> element found")]
    NoRecord,

    #[error("control field 001 is missing")]
    MissingRecid,

    #[error("control field 001 is not a positive integer: {0:?}")]
    InvalidRecid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlField {
    pub tag: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataField {
    pub tag: String,
    pub ind1: char,
    pub ind2: char,
    pub subfields: Vec<(char, String)>,
}

impl DataField {
    /// First value of subfield `code`
    pub fn get(&self, code: char) -> Option<&str> {
        self.subfields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, code: char) -> impl Iterator<Item = &str> {
        self.subfields
            .iter()
            .filter(move |(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed legacy record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarcRecord {
    pub controlfields: Vec<ControlField>,
    pub datafields: Vec<DataField>,
}

impl MarcRecord {
    /// Parse the first `<record>` element in `bytes`
    pub fn parse(bytes: &[u8]) -> Result<Self, MarcXmlError> {
        let mut reader = Reader::from_reader(bytes);

        let mut record = MarcRecord::default();
        let mut in_record = false;
        let mut seen_record = false;
        let mut current_control: Option<ControlField> = None;
        let mut current_field: Option<DataField> = None;
        let mut current_subfield: Option<(char, String)> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| MarcXmlError::Xml(format!("at byte {}: {}", reader.buffer_position(), e)))?;

            match event {
                Event::Start(ref e) => match e.local_name().as_ref() {
                    b"record" => {
                        in_record = true;
                        seen_record = true;
                    }
                    b"controlfield" if in_record => {
                        current_control = Some(ControlField {
                            tag: attr(e, b"tag")?.unwrap_or_default(),
                            value: String::new(),
                        });
                    }
                    b"datafield" if in_record => current_field = Some(data_field(e)?),
                    b"subfield" if current_field.is_some() => {
                        let code = attr(e, b"code")?
                            .and_then(|c| c.chars().next())
                            .unwrap_or(' ');
                        current_subfield = Some((code, String::new()));
                    }
                    _ => {}
                },
                Event::Empty(ref e) => match e.local_name().as_ref() {
                    b"datafield" if in_record => record.datafields.push(data_field(e)?),
                    b"record" => seen_record = true,
                    _ => {}
                },
                Event::Text(ref t) => {
                    let text = t
                        .unescape()
                        .map_err(|e| MarcXmlError::Xml(e.to_string()))?;
                    append_text(&mut current_control, &mut current_subfield, &text);
                }
                Event::CData(ref c) => {
                    let text = String::from_utf8_lossy(c.as_ref()).into_owned();
                    append_text(&mut current_control, &mut current_subfield, &text);
                }
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"controlfield" => {
                        if let Some(mut field) = current_control.take() {
                            field.value = field.value.trim().to_string();
                            record.controlfields.push(field);
                        }
                    }
                    b"subfield" => {
                        if let (Some(field), Some((code, value))) =
                            (current_field.as_mut(), current_subfield.take())
                        {
                            field.subfields.push((code, value.trim().to_string()));
                        }
                    }
                    b"datafield" => {
                        if let Some(field) = current_field.take() {
                            record.datafields.push(field);
                        }
                    }
                    b"record" => break,
                    _ => {}
                },
                Event::Eof => {
                    if in_record {
                        return Err(MarcXmlError::Xml("unexpected end of record".to_string()));
                    }
                    break;
                }
                _ => {}
            }
        }

        if !seen_record {
            return Err(MarcXmlError::NoRecord);
        }

        Ok(record)
    }

    pub fn controlfield(&self, tag: &str) -> Option<&str> {
        self.controlfields
            .iter()
            .find(|f| f.tag == tag)
            .map(|f| f.value.as_str())
    }

    pub fn fields<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a DataField> + 'a {
        self.datafields.iter().filter(move |f| f.tag == tag)
    }

    /// Data fields matching tag and both indicators (`' '` for blank)
    pub fn fields_with<'a>(
        &'a self,
        tag: &'a str,
        ind1: char,
        ind2: char,
    ) -> impl Iterator<Item = &'a DataField> + 'a {
        self.fields(tag)
            .filter(move |f| f.ind1 == ind1 && f.ind2 == ind2)
    }

    /// Legacy numeric id from control field 001
    pub fn recid(&self) -> Result<u64, MarcXmlError> {
        let raw = self.controlfield("001").ok_or(MarcXmlError::MissingRecid)?;
        raw.parse::<u64>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| MarcXmlError::InvalidRecid(raw.to_string()))
    }

    /// Upper-cased collection memberships from `980__a`
    pub fn collections(&self) -> Vec<String> {
        self.fields("980")
            .flat_map(|f| f.get_all('a'))
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

/// Legacy numeric id of a raw record
pub fn extract_recid(bytes: &[u8]) -> Result<u64, MarcXmlError> {
    MarcRecord::parse(bytes)?.recid()
}

fn append_text(
    control: &mut Option<ControlField>,
    subfield: &mut Option<(char, String)>,
    text: &str,
) {
    if let Some(field) = control.as_mut() {
        field.value.push_str(text);
    } else if let Some((_, value)) = subfield.as_mut() {
        value.push_str(text);
    }
}

fn data_field(e: &BytesStart<'_>) -> Result<DataField, MarcXmlError> {
    Ok(DataField {
        tag: attr(e, b"tag")?.unwrap_or_default(),
        ind1: indicator(attr(e, b"ind1")?),
        ind2: indicator(attr(e, b"ind2")?),
        subfields: Vec::new(),
    })
}

fn indicator(value: Option<String>) -> char {
    match value.and_then(|v| v.chars().next()) {
        None | Some('_') => ' ',
        Some(c) => c,
    }
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, MarcXmlError> {
    for attribute in e.attributes() {
        let attribute = attribute.map_err(|err| MarcXmlError::Xml(err.to_string()))?;
        if attribute.key.local_name().as_ref() == name {
            let value = attribute
                .unescape_value()
                .map_err(|err| MarcXmlError::Xml(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<record>
  <controlfield tag="001">1234</controlfield>
  <controlfield tag="005">20160101000000.0</controlfield>
  <datafield tag="245" ind1=" " ind2=" ">
    <subfield code="a">Quarks &amp; Leptons</subfield>
  </datafield>
  <datafield tag="999" ind1="C" ind2="5">
    <subfield code="0">111</subfield>
    <subfield code="r">hep-th/9901001</subfield>
  </datafield>
  <datafield tag="980" ind1=" " ind2=" "><subfield code="a">hep</subfield></datafield>
  <datafield tag="980" ind1=" " ind2=" "><subfield code="a">Citeable</subfield></datafield>
</record>"#;

    #[test]
    fn test_parse_fields() {
        let record = MarcRecord::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(record.recid(), Ok(1234));
        assert_eq!(record.controlfield("005"), Some("20160101000000.0"));

        let title = record.fields("245").next().unwrap();
        assert_eq!(title.get('a'), Some("Quarks & Leptons"));

        let reference = record.fields_with("999", 'C', '5').next().unwrap();
        assert_eq!(reference.get('0'), Some("111"));
        assert_eq!(reference.get('r'), Some("hep-th/9901001"));

        assert_eq!(record.collections(), vec!["HEP", "CITEABLE"]);
    }

    #[test]
    fn test_namespaced_elements() {
        let xml = r#"<marc:record xmlns:marc="http://www.loc.gov/MARC21/slim">
            <marc:controlfield tag="001">7</marc:controlfield>
        </marc:record>"#;
        assert_eq!(extract_recid(xml.as_bytes()), Ok(7));
    }

    #[test]
    fn test_missing_recid() {
        let xml = r#"<record><datafield tag="245" ind1=" " ind2=" "/></record>"#;
        assert_eq!(extract_recid(xml.as_bytes()), Err(MarcXmlError::MissingRecid));
    }

    #[test]
    fn test_non_numeric_recid() {
        let xml = r#"<record><controlfield tag="001">abc</controlfield></record>"#;
        assert!(matches!(
            extract_recid(xml.as_bytes()),
            Err(MarcXmlError::InvalidRecid(_))
        ));
    }

    #[test]
    fn test_truncated_record_is_parse_failure() {
        let xml = r#"<record><controlfield tag="001">12</controlfield><datafield tag="245">"#;
        assert!(matches!(
            MarcRecord::parse(xml.as_bytes()),
            Err(MarcXmlError::Xml(_))
        ));
    }

    #[test]
    fn test_mismatched_tags_are_parse_failure() {
        let xml = r#"<record><controlfield tag="001">12</datafield></record>"#;
        assert!(MarcRecord::parse(xml.as_bytes()).is_err());
    }

    #[test]
    fn test_not_a_record() {
        assert_eq!(
            MarcRecord::parse(b"<collection></collection>"),
            Err(MarcXmlError::NoRecord)
        );
    }

    #[test]
    fn test_blank_indicators_normalized() {
        let xml = r#"<record><controlfield tag="001">1</controlfield>
            <datafield tag="100" ind1="_" ind2=""><subfield code="a">Doe, J.</subfield></datafield>
        </record>"#;
        let record = MarcRecord::parse(xml.as_bytes()).unwrap();
        assert_eq!(record.fields_with("100", ' ', ' ').count(), 1);
    }
}
