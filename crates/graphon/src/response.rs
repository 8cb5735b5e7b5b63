//! Result serialisation: SPARQL JSON bindings, TSV, and CSV for SELECT,
//! N-Triples for CONSTRUCT, all sent as a chunked streaming body.

use actix_web::http::header::HeaderValue;
use actix_web::HttpResponse;
use bytes::Bytes;
use futures_util::stream;
use hexad::search::executor::{execute_construct, execute_select};
use hexad::search::planner::{Plan, PlanKind};
use hexad::{ExecutionContext, Index};

const ROWS_PER_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Tsv,
    Csv,
}

pub fn negotiate(accept: Option<&HeaderValue>) -> Format {
    let Some(accept) = accept.and_then(|value| value.to_str().ok()) else {
        return Format::Json;
    };
    if accept.contains("text/tab-separated-values") {
        Format::Tsv
    } else if accept.contains("text/csv") {
        Format::Csv
    } else {
        Format::Json
    }
}

/// The fully rendered result, ready for serialisation.
pub enum Payload {
    Select { variables: Vec<String>, rows: Vec<Vec<String>> },
    Construct { triples: Vec<[String; 3]> },
}

pub fn evaluate(
    index: &Index,
    context: &ExecutionContext,
    plan: Plan,
    _format: Format,
) -> hexad::Result<Payload> {
    match plan.kind {
        PlanKind::Select { variables } => {
            let result = execute_select(&plan.tree, &variables, plan.modifiers, context)?;
            let mut rows = Vec::with_capacity(result.num_rows());
            for row in 0..result.num_rows() {
                rows.push(result.render_row(index, row)?);
            }
            Ok(Payload::Select {
                variables: variables.iter().map(|v| v.name().to_owned()).collect(),
                rows,
            })
        }
        PlanKind::Construct { template } => {
            let triples = execute_construct(&plan.tree, &template, plan.modifiers, context)?;
            Ok(Payload::Construct { triples })
        }
    }
}

pub fn stream(payload: Payload, format: Format) -> HttpResponse {
    let (content_type, chunks) = match payload {
        Payload::Select { variables, rows } => match format {
            Format::Json => ("application/sparql-results+json", json_chunks(&variables, &rows)),
            Format::Tsv => {
                ("text/tab-separated-values; charset=utf-8", table_chunks(&variables, &rows, b'\t'))
            }
            Format::Csv => ("text/csv; charset=utf-8", table_chunks(&variables, &rows, b',')),
        },
        Payload::Construct { triples } => ("application/n-triples", ntriples_chunks(&triples)),
    };
    HttpResponse::Ok()
        .content_type(content_type)
        .streaming(stream::iter(chunks.into_iter().map(Ok::<_, actix_web::Error>)))
}

fn json_term(term: &str) -> serde_json::Value {
    if let Some(iri) = term.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
        serde_json::json!({ "type": "uri", "value": iri })
    } else if let Some(blank) = term.strip_prefix("_:") {
        serde_json::json!({ "type": "bnode", "value": blank })
    } else {
        serde_json::json!({ "type": "literal", "value": term })
    }
}

fn json_chunks(variables: &[String], rows: &[Vec<String>]) -> Vec<Bytes> {
    let head = serde_json::json!({ "head": { "vars": variables } });
    let mut chunks = Vec::new();
    let mut first = head.to_string();
    // Re-open the head object so the bindings stream into it.
    first.truncate(first.len() - 1);
    first.push_str(",\"results\":{\"bindings\":[");
    chunks.push(Bytes::from(first));
    for (row_index, row) in rows.iter().enumerate() {
        let mut binding = serde_json::Map::new();
        for (variable, term) in variables.iter().zip(row) {
            if !term.is_empty() {
                binding.insert(variable.clone(), json_term(term));
            }
        }
        let mut rendered = if row_index == 0 { String::new() } else { ",".to_owned() };
        rendered.push_str(&serde_json::Value::Object(binding).to_string());
        chunks.push(Bytes::from(rendered));
    }
    chunks.push(Bytes::from_static(b"]}}"));
    chunks
}

fn table_chunks(variables: &[String], rows: &[Vec<String>], delimiter: u8) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    for block in std::iter::once(&[][..]).chain(rows.chunks(ROWS_PER_CHUNK)) {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(Vec::new());
        if block.is_empty() {
            writer.write_record(variables.iter().map(|v| format!("?{v}"))).ok();
        } else {
            for row in block {
                writer.write_record(row).ok();
            }
        }
        if let Ok(bytes) = writer.into_inner() {
            chunks.push(Bytes::from(bytes));
        }
    }
    chunks
}

fn ntriples_chunks(triples: &[[String; 3]]) -> Vec<Bytes> {
    triples
        .chunks(ROWS_PER_CHUNK)
        .map(|block| {
            let mut text = String::new();
            for [subject, predicate, object] in block {
                let object = if object.starts_with('<') || object.starts_with("_:") {
                    object.clone()
                } else {
                    format!("{object:?}")
                };
                text.push_str(&format!("{subject} {predicate} {object} .\n"));
            }
            Bytes::from(text)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_defaults_to_json() {
        assert_eq!(negotiate(None), Format::Json);
        let tsv = HeaderValue::from_static("text/tab-separated-values");
        assert_eq!(negotiate(Some(&tsv)), Format::Tsv);
        let csv = HeaderValue::from_static("text/csv;q=0.9");
        assert_eq!(negotiate(Some(&csv)), Format::Csv);
    }

    #[test]
    fn json_body_is_valid_sparql_results() {
        let chunks = json_chunks(
            &["x".to_owned(), "y".to_owned()],
            &[
                vec!["<http://a>".to_owned(), "42".to_owned()],
                vec!["_:b0".to_owned(), String::new()],
            ],
        );
        let body: Vec<u8> = chunks.iter().flat_map(|chunk| chunk.to_vec()).collect();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["head"]["vars"][0], "x");
        let bindings = parsed["results"]["bindings"].as_array().unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0]["x"]["type"], "uri");
        assert_eq!(bindings[0]["x"]["value"], "http://a");
        // An empty term is an absent binding.
        assert!(bindings[1].get("y").is_none());
    }

    #[test]
    fn tsv_has_a_header_and_one_line_per_row() {
        let chunks = table_chunks(
            &["s".to_owned()],
            &[vec!["<a>".to_owned()], vec!["<b>".to_owned()]],
            b'\t',
        );
        let body: Vec<u8> = chunks.iter().flat_map(|chunk| chunk.to_vec()).collect();
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("?s"));
    }
}
