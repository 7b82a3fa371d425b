//! HL7 ⇄ XML.
//!
//! The structural form nests `Segment` → `Field` → `Repetition` → `Component` → `SubComponent`,
//! each element carrying its 1-based `position`. Levels that are not present in the data are
//! not emitted: a field without repetitions or components is plain text. Text is written in wire
//! form and without indentation so that [`from_xml`] rebuilds byte-identical segments.
//!
//! [`to_clinical_xml`] is a one-way, human oriented projection of `PID`, `PV1` and `OBX`
//! into a patient header plus coded Encounters and Results sections.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt;

use super::{assemble, checked_position, delimiters_from_header, segment_line};
use crate::error::Hl7Error;
use crate::hl7::delimiters::HEADER_SEGMENT;
use crate::hl7::{datetime, escape, Delimiters, Hl7Message, Segment};

pub const ROOT_ELEMENT: &str = "HL7Message";

const LOINC: &str = "2.16.840.1.113883.6.1";
const ENCOUNTERS_SECTION: &str = "46240-8";
const RESULTS_SECTION: &str = "30954-2";

fn xml_error(err: impl fmt::Display) -> Hl7Error {
    Hl7Error::Xml(err.to_string())
}

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn new() -> Result<XmlOut, Hl7Error> {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;
        Ok(XmlOut { writer })
    }

    fn element<'a>(name: &'a str, attributes: &[(&'a str, &'a str)]) -> BytesStart<'a> {
        let mut start = BytesStart::new(name);
        for attribute in attributes {
            start.push_attribute(*attribute);
        }
        start
    }

    fn start(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<(), Hl7Error> {
        self.writer
            .write_event(Event::Start(Self::element(name, attributes)))
            .map_err(xml_error)
    }

    fn end(&mut self, name: &str) -> Result<(), Hl7Error> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(xml_error)
    }

    fn empty(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<(), Hl7Error> {
        self.writer
            .write_event(Event::Empty(Self::element(name, attributes)))
            .map_err(xml_error)
    }

    fn text(&mut self, text: &str) -> Result<(), Hl7Error> {
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(xml_error)
    }

    /// `<name attrs>text</name>`, or `<name attrs/>` when the text is empty.
    fn leaf(&mut self, name: &str, attributes: &[(&str, &str)], text: &str) -> Result<(), Hl7Error> {
        if text.is_empty() {
            return self.empty(name, attributes);
        }
        self.start(name, attributes)?;
        self.text(text)?;
        self.end(name)
    }

    fn finish(self) -> Result<String, Hl7Error> {
        String::from_utf8(self.writer.into_inner()).map_err(xml_error)
    }
}

pub fn to_xml(message: &Hl7Message) -> Result<String, Hl7Error> {
    let d = &message.delimiters;
    let mut out = XmlOut::new()?;

    let timestamp = message.timestamp.to_rfc3339();
    out.start(
        ROOT_ELEMENT,
        &[
            ("id", message.id.as_str()),
            ("type", message.message_type.code()),
            ("version", message.version.as_str()),
            ("timestamp", timestamp.as_str()),
        ],
    )?;

    let (field, component, repetition, escape, sub_component) = (
        d.field.to_string(),
        d.component.to_string(),
        d.repetition.to_string(),
        d.escape.to_string(),
        d.sub_component.to_string(),
    );
    out.empty(
        "Delimiters",
        &[
            ("field", field.as_str()),
            ("component", component.as_str()),
            ("repetition", repetition.as_str()),
            ("escape", escape.as_str()),
            ("subComponent", sub_component.as_str()),
        ],
    )?;

    for segment in &message.segments {
        let sequence = segment.sequence.to_string();
        out.start(
            "Segment",
            &[("type", segment.segment_type.as_str()), ("sequence", sequence.as_str())],
        )?;
        for field in &segment.fields {
            let position = field.position.to_string();
            let attributes = [("position", position.as_str())];
            let value = field.to_wire(d);
            let literal = segment.is_header() && field.position <= 2;

            if literal || !value.contains([d.repetition, d.component]) {
                out.leaf("Field", &attributes, &value)?;
            } else if value.contains(d.repetition) {
                out.start("Field", &attributes)?;
                for (i, occurrence) in value.split(d.repetition).enumerate() {
                    let position = (i + 1).to_string();
                    let attributes = [("position", position.as_str())];
                    if occurrence.contains(d.component) {
                        out.start("Repetition", &attributes)?;
                        write_components(&mut out, occurrence, d)?;
                        out.end("Repetition")?;
                    } else {
                        out.leaf("Repetition", &attributes, occurrence)?;
                    }
                }
                out.end("Field")?;
            } else {
                out.start("Field", &attributes)?;
                write_components(&mut out, &value, d)?;
                out.end("Field")?;
            }
        }
        out.end("Segment")?;
    }

    out.end(ROOT_ELEMENT)?;
    out.finish()
}

fn write_components(out: &mut XmlOut, value: &str, d: &Delimiters) -> Result<(), Hl7Error> {
    for (i, component) in value.split(d.component).enumerate() {
        let position = (i + 1).to_string();
        let attributes = [("position", position.as_str())];
        if component.contains(d.sub_component) {
            out.start("Component", &attributes)?;
            for (j, sub) in component.split(d.sub_component).enumerate() {
                let position = (j + 1).to_string();
                out.leaf("SubComponent", &[("position", position.as_str())], sub)?;
            }
            out.end("Component")?;
        } else {
            out.leaf("Component", &attributes, component)?;
        }
    }
    Ok(())
}

/// Minimal element tree for reading.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Element, Hl7Error> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(xml_error)?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute.unescape_value().map_err(xml_error)?.into_owned();
            attributes.push((key, value));
        }
        Ok(Element {
            name,
            attributes,
            ..Element::default()
        })
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Joins the children called `name` by their `position`, filling gaps with empty values.
    fn join_positioned(&self, name: &str, separator: char, value: impl Fn(&Element) -> String) -> String {
        let mut values: Vec<(usize, String)> = self
            .children_named(name)
            .enumerate()
            .map(|(i, child)| (position(child, i), value(child)))
            .collect();
        values.sort_by_key(|(p, _)| *p);

        let mut joined = String::new();
        let mut next = 1;
        for (p, v) in values {
            while next < p {
                if next > 1 {
                    joined.push(separator);
                }
                next += 1;
            }
            if next > 1 {
                joined.push(separator);
            }
            joined.push_str(&v);
            next = p + 1;
        }
        joined
    }
}

fn position(element: &Element, index: usize) -> usize {
    element
        .attribute("position")
        .and_then(|p| p.trim().parse().ok())
        .filter(|p| *p > 0)
        .unwrap_or(index + 1)
}

/// Rejects any numeric `position` attribute above the accepted range, anywhere in the tree.
fn check_positions(root: &Element) -> Result<(), Hl7Error> {
    let mut pending = vec![root];
    while let Some(element) = pending.pop() {
        if let Some(p) = element.attribute("position") {
            let p = p.trim();
            if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) {
                checked_position(p)?;
            }
        }
        pending.extend(element.children.iter());
    }
    Ok(())
}

fn attach(element: Element, stack: &mut [Element], root: &mut Option<Element>) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => *root = Some(element),
    }
}

fn parse_tree(text: &str) -> Result<Element, Hl7Error> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(start) => stack.push(Element::from_start(&start)?),
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                attach(element, &mut stack, &mut root);
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Hl7Error::Xml("unbalanced closing tag".to_string()))?;
                attach(element, &mut stack, &mut root);
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text.unescape().map_err(xml_error)?);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    root.ok_or_else(|| Hl7Error::Xml("document has no root element".to_string()))
}

fn components_value(element: &Element, d: &Delimiters) -> String {
    if !element.children.iter().any(|c| c.name == "Component") {
        return element.text.clone();
    }
    element.join_positioned("Component", d.component, |component| {
        if component.children.iter().any(|c| c.name == "SubComponent") {
            component.join_positioned("SubComponent", d.sub_component, |sub| sub.text.clone())
        } else {
            component.text.clone()
        }
    })
}

fn field_value(field: &Element, d: &Delimiters) -> String {
    if field.children.iter().any(|c| c.name == "Repetition") {
        field.join_positioned("Repetition", d.repetition, |r| components_value(r, d))
    } else {
        components_value(field, d)
    }
}

fn single_char(value: Option<&str>) -> Option<char> {
    let mut chars = value?.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

/// Rebuilds a message from the structural form.
pub fn from_xml(text: &str) -> Result<Hl7Message, Hl7Error> {
    let root = parse_tree(text)?;
    if root.name != ROOT_ELEMENT {
        return Err(Hl7Error::InvalidStructure(format!(
            "expected <{}> root, found <{}>",
            ROOT_ELEMENT, root.name
        )));
    }
    check_positions(&root)?;

    let declared = root.children_named("Delimiters").next().and_then(|e| {
        Some(Delimiters {
            field: single_char(e.attribute("field"))?,
            component: single_char(e.attribute("component"))?,
            repetition: single_char(e.attribute("repetition"))?,
            escape: single_char(e.attribute("escape"))?,
            sub_component: single_char(e.attribute("subComponent"))?,
        })
    });
    let header_field = |wanted: usize| -> Option<String> {
        root.children_named("Segment")
            .find(|s| s.attribute("type") == Some(HEADER_SEGMENT))?
            .children_named("Field")
            .enumerate()
            .find(|(i, f)| position(f, *i) == wanted)
            .map(|(_, f)| f.text.clone())
    };
    let delimiters = match declared {
        Some(d) => d,
        None => delimiters_from_header(header_field(1).as_deref(), header_field(2).as_deref()),
    };

    let mut lines = Vec::new();
    for segment in root.children_named("Segment") {
        let segment_type = segment
            .attribute("type")
            .ok_or_else(|| Hl7Error::InvalidStructure("<Segment> without a type".to_string()))?;

        let mut fields: Vec<(usize, String)> = segment
            .children_named("Field")
            .enumerate()
            .map(|(i, f)| (position(f, i), field_value(f, &delimiters)))
            .collect();
        fields.sort_by_key(|(p, _)| *p);

        let count = fields.last().map_or(0, |(p, _)| *p);
        let mut values = vec![String::new(); count];
        for (p, v) in fields {
            values[p - 1] = v;
        }
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        lines.push(segment_line(segment_type, &values, &delimiters));
    }

    if lines.is_empty() {
        return Err(Hl7Error::InvalidStructure("XML document has no segments".to_string()));
    }
    Ok(assemble(&lines))
}

/// Decoded value of `field`, first repetition, optionally one component.
fn value_at(segment: &Segment, field: usize, component: Option<usize>, d: &Delimiters) -> String {
    let Some(value) = segment.field(field).map(|f| f.value.as_str()) else {
        return String::new();
    };
    let occurrence = value.split(d.repetition).next().unwrap_or_default();
    let raw = match component {
        None => occurrence,
        Some(c) => occurrence.split(d.component).nth(c - 1).unwrap_or_default(),
    };
    escape::unescape(raw, d).into_owned()
}

fn non_empty<'a>(attributes: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    attributes.iter().copied().filter(|(_, v)| !v.is_empty()).collect()
}

/// The clinical document projection: patient from `PID`, encounters from `PV1`, results from `OBX`.
pub fn to_clinical_xml(message: &Hl7Message) -> Result<String, Hl7Error> {
    let d = &message.delimiters;
    let mut out = XmlOut::new()?;

    out.start("ClinicalDocument", &[])?;
    out.empty("id", &[("root", message.id.as_str())])?;
    out.leaf("title", &[], "Clinical Summary")?;
    let effective = datetime::format_timestamp(&message.timestamp);
    out.empty("effectiveTime", &[("value", effective.as_str())])?;

    if let Some(pid) = message.segment("PID") {
        write_record_target(&mut out, pid, d)?;
    }

    let encounters: Vec<&Segment> = message.segments_of("PV1").collect();
    let results: Vec<&Segment> = message.segments_of("OBX").collect();
    if !encounters.is_empty() || !results.is_empty() {
        out.start("component", &[])?;
        out.start("structuredBody", &[])?;
        if !encounters.is_empty() {
            start_section(&mut out, ENCOUNTERS_SECTION, "History of encounters", "Encounters")?;
            for pv1 in encounters {
                write_encounter(&mut out, pv1, d)?;
            }
            end_section(&mut out)?;
        }
        if !results.is_empty() {
            start_section(
                &mut out,
                RESULTS_SECTION,
                "Relevant diagnostic tests and/or laboratory data",
                "Results",
            )?;
            for obx in results {
                write_observation(&mut out, obx, d)?;
            }
            end_section(&mut out)?;
        }
        out.end("structuredBody")?;
        out.end("component")?;
    }

    out.end("ClinicalDocument")?;
    out.finish()
}

fn write_record_target(out: &mut XmlOut, pid: &Segment, d: &Delimiters) -> Result<(), Hl7Error> {
    out.start("recordTarget", &[])?;
    out.start("patientRole", &[])?;

    let id = value_at(pid, 3, Some(1), d);
    let authority = value_at(pid, 3, Some(4), d);
    out.empty("id", &non_empty(&[("extension", id.as_str()), ("assigningAuthorityName", authority.as_str())]))?;

    let street = value_at(pid, 11, Some(1), d);
    let city = value_at(pid, 11, Some(3), d);
    let state = value_at(pid, 11, Some(4), d);
    let postal = value_at(pid, 11, Some(5), d);
    if [&street, &city, &state, &postal].iter().any(|v| !v.is_empty()) {
        out.start("addr", &[])?;
        out.leaf("streetAddressLine", &[], &street)?;
        out.leaf("city", &[], &city)?;
        out.leaf("state", &[], &state)?;
        out.leaf("postalCode", &[], &postal)?;
        out.end("addr")?;
    }

    let phone = value_at(pid, 13, Some(1), d);
    if !phone.is_empty() {
        let telecom = format!("tel:{}", phone);
        out.empty("telecom", &[("value", telecom.as_str())])?;
    }

    out.start("patient", &[])?;
    out.start("name", &[])?;
    out.leaf("given", &[], &value_at(pid, 5, Some(2), d))?;
    let middle = value_at(pid, 5, Some(3), d);
    if !middle.is_empty() {
        out.leaf("given", &[], &middle)?;
    }
    out.leaf("family", &[], &value_at(pid, 5, Some(1), d))?;
    out.end("name")?;
    let gender = value_at(pid, 8, None, d);
    out.empty("administrativeGenderCode", &non_empty(&[("code", gender.as_str())]))?;
    let birth = value_at(pid, 7, None, d);
    out.empty("birthTime", &non_empty(&[("value", birth.as_str())]))?;
    out.end("patient")?;

    out.end("patientRole")?;
    out.end("recordTarget")
}

fn start_section(out: &mut XmlOut, code: &str, display: &str, title: &str) -> Result<(), Hl7Error> {
    out.start("component", &[])?;
    out.start("section", &[])?;
    out.empty(
        "code",
        &[("code", code), ("codeSystem", LOINC), ("displayName", display)],
    )?;
    out.leaf("title", &[], title)
}

fn end_section(out: &mut XmlOut) -> Result<(), Hl7Error> {
    out.end("section")?;
    out.end("component")
}

fn write_encounter(out: &mut XmlOut, pv1: &Segment, d: &Delimiters) -> Result<(), Hl7Error> {
    out.start("entry", &[])?;
    out.start("encounter", &[("classCode", "ENC"), ("moodCode", "EVN")])?;

    let visit = value_at(pv1, 19, Some(1), d);
    out.empty("id", &non_empty(&[("extension", visit.as_str())]))?;
    let class = value_at(pv1, 2, None, d);
    out.empty("code", &non_empty(&[("code", class.as_str())]))?;

    let admitted = value_at(pv1, 44, None, d);
    let discharged = value_at(pv1, 45, None, d);
    if !admitted.is_empty() || !discharged.is_empty() {
        out.start("effectiveTime", &[])?;
        out.empty("low", &non_empty(&[("value", admitted.as_str())]))?;
        out.empty("high", &non_empty(&[("value", discharged.as_str())]))?;
        out.end("effectiveTime")?;
    }

    let location = [1, 2, 3]
        .iter()
        .map(|c| value_at(pv1, 3, Some(*c), d))
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if !location.is_empty() {
        out.leaf("location", &[], &location)?;
    }

    let attender = pv1
        .field(7)
        .map(|f| f.value.split(d.repetition).next().unwrap_or_default().to_string())
        .unwrap_or_default();
    if !attender.is_empty() {
        let id = value_at(pv1, 7, Some(1), d);
        out.start("performer", &[])?;
        out.empty("id", &non_empty(&[("extension", id.as_str())]))?;
        let name = crate::transform::functions::format_name(
            attender.split_once(d.component).map_or("", |(_, rest)| rest),
            d,
        );
        out.leaf("name", &[], &name)?;
        out.end("performer")?;
    }

    out.end("encounter")?;
    out.end("entry")
}

fn write_observation(out: &mut XmlOut, obx: &Segment, d: &Delimiters) -> Result<(), Hl7Error> {
    out.start("entry", &[])?;
    out.start("observation", &[("classCode", "OBS"), ("moodCode", "EVN")])?;

    let code = value_at(obx, 3, Some(1), d);
    let display = value_at(obx, 3, Some(2), d);
    let system = value_at(obx, 3, Some(3), d);
    out.empty(
        "code",
        &non_empty(&[
            ("code", code.as_str()),
            ("displayName", display.as_str()),
            ("codeSystemName", system.as_str()),
        ]),
    )?;

    let value_type = value_at(obx, 2, None, d);
    let value = value_at(obx, 5, None, d);
    let unit = value_at(obx, 6, Some(1), d);
    out.empty(
        "value",
        &non_empty(&[("type", value_type.as_str()), ("value", value.as_str()), ("unit", unit.as_str())]),
    )?;

    let range = value_at(obx, 7, None, d);
    if !range.is_empty() {
        out.leaf("referenceRange", &[], &range)?;
    }
    let interpretation = value_at(obx, 8, None, d);
    if !interpretation.is_empty() {
        out.empty("interpretationCode", &[("code", interpretation.as_str())])?;
    }
    let status = value_at(obx, 11, None, d);
    if !status.is_empty() {
        out.empty("statusCode", &[("code", status.as_str())])?;
    }
    let observed = value_at(obx, 14, None, d);
    if !observed.is_empty() {
        out.empty("effectiveTime", &[("value", observed.as_str())])?;
    }

    out.end("observation")?;
    out.end("entry")
}
