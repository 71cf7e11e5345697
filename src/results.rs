//! Result extraction from output artifacts
//!
//! A finished workload records zero or more named result values ("scraps")
//! inside its output notebook, either as structured JSON data or as rich
//! display output (images, HTML). Extraction walks the artifact's cell
//! outputs and collapses what it finds into a single result payload:
//! nothing recorded falls back to a link to the artifact, one recorded
//! value is returned directly, several are returned as a name-keyed map.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::error::Error;

/// Media type under which structured data scraps are recorded
const SCRAP_DATA_MIME: &str = "application/scrapbook.scrap.json+json";

/// A single named value recorded by the workload
#[derive(Clone, Debug, PartialEq)]
pub struct Scrap {
    /// Name the workload recorded the value under
    pub name: String,
    /// The recorded content
    pub kind: ScrapKind,
}

/// The two kinds of recorded values
#[derive(Clone, Debug, PartialEq)]
pub enum ScrapKind {
    /// Structured JSON data
    Data(Value),
    /// Rich display output, keyed by media type
    Display(BTreeMap<String, Value>),
}

/// Extracted result content
#[derive(Clone, Debug, PartialEq)]
pub enum ResultPayload {
    /// A JSON document
    Json(Value),
    /// Raw bytes, described by the accompanying media type
    Binary(Vec<u8>),
}

/// The final result of a job, ready to serve
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedResult {
    /// The payload
    pub payload: ResultPayload,
    /// Media type of a binary payload; `None` for JSON payloads
    pub mime_type: Option<String>,
}

/// Extract the job result from an output artifact.
///
/// `result_link` feeds the zero-scrap fallback so a caller still gets a
/// pointer to the artifact when the workload recorded nothing.
pub fn extract(artifact: &str, result_link: Option<&str>) -> Result<ExtractedResult, Error> {
    let scraps = read_scraps(artifact)?;
    extract_from_scraps(scraps, result_link)
}

/// Parse an artifact and collect its recorded scraps in cell order
pub fn read_scraps(artifact: &str) -> Result<Vec<Scrap>, Error> {
    let notebook: Value = serde_json::from_str(artifact)
        .map_err(|e| Error::artifact(format!("output artifact is not valid JSON: {e}")))?;
    let cells = notebook
        .get("cells")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::artifact("output artifact has no cells"))?;

    let mut scraps = Vec::new();
    for output in cells
        .iter()
        .filter_map(|cell| cell.get("outputs").and_then(Value::as_array))
        .flatten()
        .filter(|output| output.get("output_type").and_then(Value::as_str) == Some("display_data"))
    {
        if let Some(scrap) = data_scrap(output).or_else(|| display_scrap(output)) {
            scraps.push(scrap);
        }
    }
    Ok(scraps)
}

/// A structured data scrap: `{name, data}` recorded under the scrap media
/// type in the output's data bundle
fn data_scrap(output: &Value) -> Option<Scrap> {
    let record = output.get("data")?.get(SCRAP_DATA_MIME)?;
    Some(Scrap {
        name: record.get("name")?.as_str()?.to_string(),
        kind: ScrapKind::Data(record.get("data")?.clone()),
    })
}

/// A display scrap: a named rich output, name carried in the scrapbook
/// metadata and content in the regular data bundle
fn display_scrap(output: &Value) -> Option<Scrap> {
    let name = output
        .get("metadata")?
        .get("scrapbook")?
        .get("name")?
        .as_str()?
        .to_string();
    let data = output
        .get("data")?
        .as_object()?
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Some(Scrap { name, kind: ScrapKind::Display(data) })
}

/// Collapse recorded scraps into the served result.
///
/// Zero scraps serve a link to the artifact itself, one scrap serves its
/// content directly, several serve a map keyed by scrap name.
fn extract_from_scraps(
    mut scraps: Vec<Scrap>,
    result_link: Option<&str>,
) -> Result<ExtractedResult, Error> {
    match scraps.len() {
        0 => Ok(ExtractedResult {
            payload: ResultPayload::Json(serde_json::json!({ "result_link": result_link })),
            mime_type: None,
        }),
        1 => match scraps.remove(0).kind {
            ScrapKind::Data(value) => Ok(ExtractedResult {
                payload: ResultPayload::Json(value),
                mime_type: None,
            }),
            ScrapKind::Display(data) => single_display_result(data),
        },
        _ => {
            let map: serde_json::Map<String, Value> = scraps
                .into_iter()
                .map(|scrap| {
                    let content = match scrap.kind {
                        ScrapKind::Data(value) => value,
                        ScrapKind::Display(data) => {
                            Value::Object(data.into_iter().collect())
                        }
                    };
                    (scrap.name, content)
                })
                .collect();
            Ok(ExtractedResult {
                payload: ResultPayload::Json(Value::Object(map)),
                mime_type: None,
            })
        }
    }
}

/// Serve a sole display scrap as its richest representation.
///
/// Images win over any other media type; text/plain is a repr fallback the
/// workload always emits, so it is only served when nothing else exists.
/// Binary-encoded content is decoded; markup representations (text/html,
/// image/svg+xml stored as plain XML) are served as their raw text, both
/// under the representation's media type.
fn single_display_result(data: BTreeMap<String, Value>) -> Result<ExtractedResult, Error> {
    let preferred = data
        .keys()
        .find(|k| k.starts_with("image/"))
        .or_else(|| data.keys().find(|k| *k != "text/plain"))
        .cloned();

    match preferred {
        Some(mime) => {
            let content = &data[&mime];
            let payload = match decode_display_content(content) {
                Some(bytes) => ResultPayload::Binary(bytes),
                None => match join_lines(content) {
                    Some(text) => ResultPayload::Binary(text.into_bytes()),
                    None => ResultPayload::Json(content.clone()),
                },
            };
            Ok(ExtractedResult {
                payload,
                mime_type: Some(mime),
            })
        }
        None => {
            let text = data
                .get("text/plain")
                .cloned()
                .ok_or_else(|| Error::artifact("display output carries no content"))?;
            Ok(ExtractedResult {
                payload: ResultPayload::Json(text),
                mime_type: None,
            })
        }
    }
}

/// Decode base64-encoded display content to raw bytes.
///
/// Embedded whitespace is not significant; returns `None` for content
/// that is not base64 (markup representations are stored verbatim).
fn decode_display_content(content: &Value) -> Option<Vec<u8>> {
    let joined = join_lines(content)?;
    let compact: String = joined.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64.decode(compact).ok()
}

/// Display content as one string: stored either directly or as a list of
/// line strings
fn join_lines(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(lines) => Some(
            lines
                .iter()
                .map(|line| line.as_str())
                .collect::<Option<Vec<_>>>()?
                .concat(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notebook(outputs: Value) -> String {
        serde_json::json!({
            "cells": [
                { "cell_type": "markdown", "source": ["# intro"] },
                { "cell_type": "code", "outputs": outputs, "source": [] },
            ],
            "nbformat": 4,
        })
        .to_string()
    }

    fn data_scrap_output(name: &str, data: Value) -> Value {
        serde_json::json!({
            "output_type": "display_data",
            "data": {
                SCRAP_DATA_MIME: { "name": name, "data": data, "encoder": "json" }
            },
            "metadata": { "scrapbook": { "name": name, "data": true, "display": false } }
        })
    }

    #[test]
    fn no_scraps_falls_back_to_result_link() {
        let artifact = notebook(serde_json::json!([
            { "output_type": "stream", "text": ["hello\n"] }
        ]));
        let result = extract(&artifact, Some("https://hub/lab/tree/out.ipynb")).unwrap();
        assert_eq!(
            result.payload,
            ResultPayload::Json(
                serde_json::json!({ "result_link": "https://hub/lab/tree/out.ipynb" })
            )
        );
        assert!(result.mime_type.is_none());
    }

    #[test]
    fn single_data_scrap_is_served_directly() {
        let artifact = notebook(serde_json::json!([
            data_scrap_output("answer", serde_json::json!({"value": 42}))
        ]));
        let result = extract(&artifact, None).unwrap();
        assert_eq!(
            result.payload,
            ResultPayload::Json(serde_json::json!({"value": 42}))
        );
        assert!(result.mime_type.is_none());
    }

    #[test]
    fn single_image_scrap_is_decoded_to_bytes() {
        let png_b64 = BASE64.encode(b"\x89PNG fake");
        let artifact = notebook(serde_json::json!([
            {
                "output_type": "display_data",
                "metadata": { "scrapbook": { "name": "plot" } },
                "data": {
                    "text/plain": "<Figure>",
                    "image/png": png_b64,
                }
            }
        ]));
        let result = extract(&artifact, None).unwrap();
        assert_eq!(result.mime_type.as_deref(), Some("image/png"));
        assert_eq!(result.payload, ResultPayload::Binary(b"\x89PNG fake".to_vec()));
    }

    #[test]
    fn multi_line_base64_is_joined_before_decoding() {
        let encoded = BASE64.encode(b"split content");
        let (head, tail) = encoded.split_at(8);
        let artifact = notebook(serde_json::json!([
            {
                "output_type": "display_data",
                "metadata": { "scrapbook": { "name": "blob" } },
                "data": {
                    "image/png": [format!("{head}\n"), tail],
                }
            }
        ]));
        let result = extract(&artifact, None).unwrap();
        assert_eq!(result.payload, ResultPayload::Binary(b"split content".to_vec()));
    }

    #[test]
    fn html_display_scrap_is_served_as_markup_with_its_media_type() {
        let artifact = notebook(serde_json::json!([
            {
                "output_type": "display_data",
                "metadata": { "scrapbook": { "name": "table" } },
                "data": {
                    "text/plain": "<pandas.DataFrame>",
                    "text/html": ["<table>\n", "<tr><td>1</td></tr>\n", "</table>"],
                }
            }
        ]));
        let result = extract(&artifact, None).unwrap();
        assert_eq!(result.mime_type.as_deref(), Some("text/html"));
        assert_eq!(
            result.payload,
            ResultPayload::Binary(b"<table>\n<tr><td>1</td></tr>\n</table>".to_vec())
        );
    }

    #[test]
    fn svg_stored_as_xml_is_served_verbatim() {
        let svg = "<svg xmlns=\"http://www.w3.org/2000/svg\"/>";
        let artifact = notebook(serde_json::json!([
            {
                "output_type": "display_data",
                "metadata": { "scrapbook": { "name": "figure" } },
                "data": {
                    "text/plain": "<Figure>",
                    "image/svg+xml": svg,
                }
            }
        ]));
        let result = extract(&artifact, None).unwrap();
        assert_eq!(result.mime_type.as_deref(), Some("image/svg+xml"));
        assert_eq!(result.payload, ResultPayload::Binary(svg.as_bytes().to_vec()));
    }

    #[test]
    fn text_only_display_scrap_is_served_as_json() {
        let artifact = notebook(serde_json::json!([
            {
                "output_type": "display_data",
                "metadata": { "scrapbook": { "name": "summary" } },
                "data": { "text/plain": "'all done'" }
            }
        ]));
        let result = extract(&artifact, None).unwrap();
        assert_eq!(result.payload, ResultPayload::Json(Value::String("'all done'".into())));
        assert!(result.mime_type.is_none());
    }

    #[test]
    fn multiple_scraps_become_a_name_keyed_map() {
        let artifact = notebook(serde_json::json!([
            data_scrap_output("first", serde_json::json!(1)),
            data_scrap_output("second", serde_json::json!({"b": 2})),
        ]));
        let result = extract(&artifact, None).unwrap();
        assert_eq!(
            result.payload,
            ResultPayload::Json(serde_json::json!({ "first": 1, "second": {"b": 2} }))
        );
        assert!(result.mime_type.is_none());
    }

    #[test]
    fn non_display_outputs_are_ignored() {
        let artifact = notebook(serde_json::json!([
            { "output_type": "stream", "text": ["log line\n"] },
            { "output_type": "execute_result", "data": { "text/plain": "3" } },
            data_scrap_output("only", serde_json::json!("value")),
        ]));
        let scraps = read_scraps(&artifact).unwrap();
        assert_eq!(scraps.len(), 1);
        assert_eq!(scraps[0].name, "only");
    }

    #[test]
    fn invalid_artifact_is_an_artifact_error() {
        assert!(matches!(
            extract("not json at all", None),
            Err(Error::Artifact(_))
        ));
        assert!(matches!(
            extract("{\"no_cells\": true}", None),
            Err(Error::Artifact(_))
        ));
    }
}
