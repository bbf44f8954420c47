//! Diff report file format.
//!
//! ```text
//! varint(run_id_count) { varint(len) utf8 }*
//! varint(collector_count) { tag:u8 varint(len) payload }*
//!
//! payload = varint(section_count) { element_type:u8 varint(count) record* }*
//! record  = run_selector:u8 element status:u8
//! ```
//!
//! A section count of zero stands for the no-diff marker.

use crate::codec::{CodecError, Reader, put_block, put_str, put_varint};
use crate::collector::CollectorKind;

use super::{DiffElement, DiffReport, Element, ElementType, Section, Status};

pub fn encode_report(report: &DiffReport) -> Result<Vec<u8>, CodecError> {
    let run_ids = report.run_ids();
    let mut out = Vec::new();
    put_varint(&mut out, run_ids.len() as u64)?;
    for run_id in run_ids {
        put_str(&mut out, run_id)?;
    }

    let kinds: Vec<CollectorKind> = report.collectors().collect();
    put_varint(&mut out, kinds.len() as u64)?;
    for kind in kinds {
        out.push(kind.tag());
        put_block(&mut out, &encode_sections(report, kind, &run_ids)?)?;
    }
    Ok(out)
}

fn encode_sections(report: &DiffReport, kind: CollectorKind, run_ids: &[&str]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let sections = match report.sections(kind) {
        Some(sections) => sections,
        None => return Ok(out),
    };
    put_varint(&mut out, sections.len() as u64)?;
    for (element_type, section) in sections {
        out.push(element_type.code());
        let elements = section.elements();
        put_varint(&mut out, elements.len() as u64)?;
        for element in elements {
            let selector = run_ids
                .iter()
                .position(|id| *id == element.run_id)
                .ok_or_else(|| CodecError::UnknownRunId(element.run_id.clone()))?;
            out.push(selector as u8);
            element.element.encode(&mut out)?;
            out.push(element.status.code());
        }
    }
    Ok(out)
}

pub fn decode_report(data: &[u8]) -> Result<DiffReport, CodecError> {
    let mut reader = Reader::new(data);
    let count = reader.count()?;
    let mut run_ids = Vec::with_capacity(count);
    for _ in 0..count {
        run_ids.push(reader.string()?);
    }
    let [run_id_a, run_id_b] = <[String; 2]>::try_from(run_ids.clone()).map_err(|_| {
        CodecError::Invalid(format!("a report compares two runs, found {count} run ids"))
    })?;
    let mut report = DiffReport::new(run_id_a, run_id_b);

    let collectors = reader.count()?;
    for _ in 0..collectors {
        let kind = CollectorKind::from_tag(reader.u8()?)?;
        if report.sections(kind).is_some() {
            return Err(CodecError::Invalid(format!("{kind} appears twice")));
        }
        let mut payload = reader.block()?;
        kind.import_diff_from_report(&mut payload, &run_ids, &mut report)?;
        if !payload.is_empty() {
            return Err(CodecError::Invalid(format!("trailing bytes in {kind} sections")));
        }
    }
    if !reader.is_empty() {
        return Err(CodecError::Invalid(format!(
            "{} trailing bytes after report",
            reader.remaining().len()
        )));
    }
    Ok(report)
}

/// Decodes one collector's sections into `report`.
pub(crate) fn decode_sections(
    kind: CollectorKind,
    reader: &mut Reader<'_>,
    run_ids: &[String],
    report: &mut DiffReport,
) -> Result<(), CodecError> {
    report.ensure_collector(kind);
    let sections = reader.count()?;
    for _ in 0..sections {
        let element_type = ElementType::from_code(reader.u8()?)?;
        if !kind.element_types().contains(&element_type) {
            return Err(CodecError::Invalid(format!("{element_type} section inside {kind}")));
        }
        if report.section(kind, element_type).is_some() {
            return Err(CodecError::Invalid(format!("{element_type} section appears twice in {kind}")));
        }

        let count = reader.count()?;
        if count == 0 {
            report.insert_section(kind, element_type, Section::NoDiff);
            continue;
        }
        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            let selector = reader.u8()?;
            let run_id = run_ids
                .get(selector as usize)
                .ok_or(CodecError::RunIdOutOfRange(selector))?;
            let element = Element::decode(element_type, reader)?;
            let status = Status::from_code(reader.u8()?)?;
            elements.push(DiffElement::new(run_id.clone(), element, status));
        }
        report.insert_section(kind, element_type, Section::Elements(elements));
    }
    Ok(())
}
