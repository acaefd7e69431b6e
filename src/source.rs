//! Source fetchers: turn a descriptor's configured origin into CSV text
//! ready for reconciliation.
//!
//! Every fetcher normalizes to the same output shape (UTF-8 CSV with a
//! sanitized header row) so the inference and import paths never care
//! where rows came from. The ticketing fetcher flattens the API's
//! structured answers into cells and prepends the response id so
//! identities stay stable across refreshes.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use regex::Regex;
use reqwest::blocking::Client;
use serde_json::Value as JsonValue;

use crate::descriptor::{SchemaDescriptor, SourceConfig};
use crate::error::SourceError;
use crate::infer::sanitize_header;
use crate::io_utils::{read_file_to_string, resolve_input_delimiter};
use crate::store::{CRED_SHEET_TOKEN, CRED_TICKETING_KEY, DescriptorStore};

pub const SHEETS_BASE: &str = "https://docs.google.com/spreadsheets";
const SHEETS_VALUES_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DEFAULT_TICKETING_BASE: &str = "https://screendoor.dobt.co";
const TICKETING_PAGE_SIZE: usize = 100;
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

fn sheet_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https://docs\.google\.com/spreadsheets/d/([^/]+)")
            .unwrap_or_else(|_| unreachable!("static regex"))
    })
}

/// Pull the spreadsheet key out of a share URL like
/// `https://docs.google.com/spreadsheets/d/KEY/edit#gid=0`.
pub fn extract_sheet_key(url: &str) -> Result<String, SourceError> {
    sheet_key_re()
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| SourceError::BadShareUrl {
            url: url.to_string(),
        })
}

fn sheet_export_url(key: &str) -> String {
    format!("{SHEETS_BASE}/d/{key}/export?format=csv")
}

/// A body that opens with an HTML document is a login or error page, not
/// an export.
fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start();
    let lower: String = head.chars().take(16).collect::<String>().to_lowercase();
    lower.starts_with("<!doctype") || lower.starts_with("<html")
}

/// Rewrite a CSV so its header row is safe for DDL generation. Rows pass
/// through untouched; short rows are padded to the header width.
pub fn clean_csv_headers(csv_text: &str) -> Result<String> {
    clean_delimited_headers(csv_text, b',')
}

/// Same rewrite for arbitrary input delimiters; output is always
/// comma-separated.
pub fn clean_delimited_headers(csv_text: &str, delimiter: u8) -> Result<String> {
    let mut reader = crate::io_utils::open_csv_reader(csv_text.as_bytes(), delimiter, true);
    let headers: Vec<String> = reader
        .headers()
        .context("Reading fetched header row")?
        .iter()
        .map(sanitize_header)
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&headers)?;
    for record in reader.records() {
        let record = record.context("Reading fetched row")?;
        let mut row: Vec<&str> = record.iter().collect();
        row.resize(headers.len(), "");
        writer.write_record(&row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(csv::IntoInnerError::into_error)
        .context("Flushing rewritten CSV")?;
    String::from_utf8(bytes).context("Rewritten CSV was not UTF-8")
}

/// Extract the `rel="next"` URL from a pagination Link header.
fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (url_part, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        let url = url_part.trim().trim_start_matches('<').trim_end_matches('>');
        Some(url.to_string())
    })
}

/// Flatten one structured ticketing answer into a cell. Unknown shapes
/// become empty cells rather than failing the export.
fn flatten_api_value(base_url: &str, value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(items) => {
            // attachment lists carry a filename per record
            if items
                .first()
                .and_then(|i| i.get("filename"))
                .is_some()
            {
                items
                    .iter()
                    .filter_map(|i| i.get("id"))
                    .filter_map(JsonValue::as_i64)
                    .map(|id| format!("{base_url}/attachments/{id}/download"))
                    .collect::<Vec<_>>()
                    .join(" ")
            } else {
                items
                    .iter()
                    .map(|i| flatten_api_value(base_url, i))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        }
        JsonValue::Object(map) => {
            if let Some(checked) = map.get("checked").and_then(JsonValue::as_array) {
                checked
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            } else if let Some(other) = map.get("other_text").and_then(JsonValue::as_str) {
                other.to_string()
            } else if let (Some(year), Some(month), Some(day)) = (
                map.get("year").and_then(JsonValue::as_str),
                map.get("month").and_then(JsonValue::as_str),
                map.get("day").and_then(JsonValue::as_str),
            ) {
                format!("{year}-{month}-{day}")
            } else {
                warn!("unhandled ticketing value shape: {value}");
                String::new()
            }
        }
    }
}

/// Field id and display label pairs for a form, in form order. The label
/// carries the id so two questions with the same wording stay distinct.
fn form_headers(form: &JsonValue) -> Result<Vec<(String, String)>, SourceError> {
    let fields = form
        .get("field_data")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| SourceError::BadApiPayload {
            detail: "form is missing field_data".to_string(),
        })?;
    let mut headers = Vec::new();
    for field in fields {
        let id = field
            .get("id")
            .map(|v| match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| SourceError::BadApiPayload {
                detail: "form field is missing its id".to_string(),
            })?;
        let label = field
            .get("label")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        headers.push((id.clone(), sanitize_header(&format!("{label} (ID: {id})"))));
    }
    Ok(headers)
}

/// Build export CSV from a form definition and its responses: a leading
/// `id` column for identity, then one column per form field.
fn build_ticket_csv(
    base_url: &str,
    form: &JsonValue,
    responses: &[JsonValue],
) -> Result<String> {
    let headers = form_headers(form)?;
    let mut writer = csv::Writer::from_writer(Vec::new());
    let header_row: Vec<&str> = std::iter::once("id")
        .chain(headers.iter().map(|(_, label)| label.as_str()))
        .collect();
    writer.write_record(&header_row)?;

    for response in responses {
        let row_id = response
            .get("id")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| SourceError::BadApiPayload {
                detail: "response is missing its id".to_string(),
            })?;
        let answers = response
            .get("responses")
            .and_then(JsonValue::as_object)
            .cloned()
            .unwrap_or_default();
        let mut row = vec![row_id.to_string()];
        for (field_id, _) in &headers {
            let cell = answers
                .get(field_id)
                .map(|v| flatten_api_value(base_url, v))
                .unwrap_or_default();
            row.push(cell);
        }
        writer.write_record(&row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(csv::IntoInnerError::into_error)
        .context("Flushing ticketing CSV")?;
    String::from_utf8(bytes).context("Ticketing CSV was not UTF-8")
}

pub struct Fetcher {
    client: Client,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    fn get_text(&self, url: &str) -> Result<String, SourceError> {
        let wrap = |source| SourceError::Http {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().map_err(wrap)?;
        let response = response.error_for_status().map_err(wrap)?;
        response.text().map_err(wrap)
    }

    fn get_json(&self, url: &str, bearer: Option<&str>) -> Result<JsonValue, SourceError> {
        let wrap = |source| SourceError::Http {
            url: url.to_string(),
            source,
        };
        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().map_err(wrap)?.error_for_status().map_err(wrap)?;
        response.json().map_err(wrap)
    }

    /// Fetch the current rows for a descriptor as CSV text.
    pub fn fetch(&self, store: &DescriptorStore, descriptor: &SchemaDescriptor) -> Result<String> {
        match &descriptor.source {
            SourceConfig::RemoteCsv { url } => self.fetch_remote_csv(url),
            SourceConfig::PrivateSheet { url } => self.fetch_private_sheet(store, url),
            SourceConfig::Ticketing {
                project_id,
                form_id,
            } => self.fetch_ticketing(store, *project_id, *form_id),
            SourceConfig::Upload { path } => {
                let encoding = crate::io_utils::resolve_encoding(None)?;
                let text = read_file_to_string(path, encoding).map_err(|err| {
                    SourceError::Upload {
                        path: path.clone(),
                        source: std::io::Error::other(format!("{err:#}")),
                    }
                })?;
                clean_delimited_headers(&text, resolve_input_delimiter(path, None))
            }
            SourceConfig::None => {
                Err(SourceError::Unconfigured(descriptor.name.clone()).into())
            }
        }
    }

    fn fetch_remote_csv(&self, url: &str) -> Result<String> {
        let target = if url.starts_with(SHEETS_BASE) {
            sheet_export_url(&extract_sheet_key(url)?)
        } else {
            url.to_string()
        };
        debug!("fetching CSV from {target}");
        let body = self.get_text(&target)?;
        if looks_like_html(&body) {
            return Err(SourceError::NotCsv {
                url: url.to_string(),
            }
            .into());
        }
        clean_csv_headers(&body)
    }

    /// Private sheets go through the values API with a stored bearer
    /// token; share links without a token cannot be fetched.
    fn fetch_private_sheet(&self, store: &DescriptorStore, url: &str) -> Result<String> {
        let token = store
            .credential(CRED_SHEET_TOKEN)?
            .ok_or_else(|| SourceError::MissingCredentials {
                name: CRED_SHEET_TOKEN.to_string(),
            })?;
        let key = extract_sheet_key(url)?;
        let api_url = format!("{SHEETS_VALUES_API}/{key}/values/A:ZZ");
        let payload = self.get_json(&api_url, Some(&token))?;

        let values = payload
            .get("values")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| SourceError::BadApiPayload {
                detail: "sheet values response had no rows".to_string(),
            })?;
        let mut rows = values.iter().map(|row| {
            row.as_array()
                .map(|cells| {
                    cells
                        .iter()
                        .map(|c| match c {
                            JsonValue::String(s) => s.clone(),
                            JsonValue::Null => String::new(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<String>>()
                })
                .unwrap_or_default()
        });
        let headers: Vec<String> = rows
            .next()
            .ok_or_else(|| SourceError::BadApiPayload {
                detail: "sheet has no header row".to_string(),
            })?
            .iter()
            .map(|h| sanitize_header(h))
            .collect();

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&headers)?;
        for mut row in rows {
            row.resize(headers.len(), String::new());
            writer.write_record(&row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(csv::IntoInnerError::into_error)
            .context("Flushing sheet CSV")?;
        String::from_utf8(bytes).context("Sheet CSV was not UTF-8")
    }

    fn fetch_ticketing(
        &self,
        store: &DescriptorStore,
        project_id: i64,
        form_id: Option<i64>,
    ) -> Result<String> {
        let api_key = store
            .credential(CRED_TICKETING_KEY)?
            .ok_or_else(|| SourceError::MissingCredentials {
                name: CRED_TICKETING_KEY.to_string(),
            })?;
        let base = DEFAULT_TICKETING_BASE;

        let form = match form_id {
            Some(id) => self.get_json(
                &format!("{base}/api/projects/{project_id}/forms/{id}?v=1&api_key={api_key}"),
                None,
            )?,
            None => {
                let forms = self.get_json(
                    &format!("{base}/api/projects/{project_id}/forms?v=1&api_key={api_key}"),
                    None,
                )?;
                forms
                    .as_array()
                    .and_then(|a| a.first())
                    .cloned()
                    .ok_or_else(|| SourceError::BadApiPayload {
                        detail: "project has no forms".to_string(),
                    })?
            }
        };
        let wanted_form = form_id.or_else(|| form.get("id").and_then(JsonValue::as_i64));

        let mut responses: Vec<JsonValue> = Vec::new();
        let mut url = Some(format!(
            "{base}/api/projects/{project_id}/responses?v=1&api_key={api_key}&per_page={TICKETING_PAGE_SIZE}"
        ));
        while let Some(page_url) = url.take() {
            let wrap = |source| SourceError::Http {
                url: page_url.clone(),
                source,
            };
            let response = self
                .client
                .get(&page_url)
                .send()
                .map_err(wrap)?
                .error_for_status()
                .map_err(wrap)?;
            url = response
                .headers()
                .get(reqwest::header::LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link);
            let page: Vec<JsonValue> = response.json().map_err(wrap)?;
            responses.extend(page);
        }
        debug!("fetched {} ticketing response(s)", responses.len());

        let filtered: Vec<JsonValue> = responses
            .into_iter()
            .filter(|r| r.get("form_id").and_then(JsonValue::as_i64) == wanted_form)
            .collect();
        build_ticket_csv(base, &form, &filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sheet_key_extraction() {
        let url = "https://docs.google.com/spreadsheets/d/aBc123_xyz/edit#gid=09232";
        assert_eq!(extract_sheet_key(url).unwrap(), "aBc123_xyz");
        assert!(matches!(
            extract_sheet_key("https://some.site/my.csv"),
            Err(SourceError::BadShareUrl { .. })
        ));
    }

    #[test]
    fn html_bodies_are_detected() {
        assert!(looks_like_html("<!DOCTYPE html><html>…"));
        assert!(looks_like_html("\n  <html lang=\"en\">"));
        assert!(!looks_like_html("id,name\n1,x\n"));
    }

    #[test]
    fn clean_csv_headers_strips_hostile_characters_and_pads_rows() {
        let csv = "Name, With \"Comma\",Other\nval1,val2,val3\nshort\n";
        let cleaned = clean_csv_headers(csv).unwrap();
        let mut lines = cleaned.lines();
        assert_eq!(lines.next().unwrap(), "Name,With Comma,Other");
        assert_eq!(lines.next().unwrap(), "val1,val2,val3");
        assert_eq!(lines.next().unwrap(), "short,,");
    }

    #[test]
    fn next_link_parsing() {
        let header = "<https://api.example/responses?page=3>; rel=\"next\", \
                      <https://api.example/responses?page=9>; rel=\"last\"";
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.example/responses?page=3")
        );
        assert_eq!(parse_next_link("<https://x>; rel=\"last\""), None);
    }

    #[test]
    fn ticketing_values_flatten_to_cells() {
        let base = "https://tickets.example";
        assert_eq!(flatten_api_value(base, &json!("plain")), "plain");
        assert_eq!(flatten_api_value(base, &json!(null)), "");
        assert_eq!(
            flatten_api_value(base, &json!({"checked": ["a", "b"]})),
            "a, b"
        );
        assert_eq!(
            flatten_api_value(base, &json!({"other_text": "something else"})),
            "something else"
        );
        assert_eq!(
            flatten_api_value(base, &json!({"day": "01", "month": "01", "year": "2019"})),
            "2019-01-01"
        );
        assert_eq!(
            flatten_api_value(base, &json!([{"filename": "a.png", "id": 7}])),
            "https://tickets.example/attachments/7/download"
        );
    }

    #[test]
    fn ticket_csv_has_leading_id_column_in_form_order() {
        let form = json!({
            "id": 5,
            "field_data": [
                {"id": "q1", "label": "Question one"},
                {"id": "q2", "label": "Checkbox"}
            ]
        });
        let responses = vec![
            json!({"id": 11903923302i64, "form_id": 5,
                   "responses": {"q1": "response 1", "q2": {"checked": ["1"]}}}),
            json!({"id": 29803243893i64, "form_id": 5,
                   "responses": {"q1": "another response", "q2": null}}),
        ];
        let csv = build_ticket_csv("https://tickets.example", &form, &responses).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,Question one (ID: q1),Checkbox (ID: q2)"
        );
        assert!(lines.next().unwrap().starts_with("11903923302,response 1,1"));
        assert!(lines.next().unwrap().starts_with("29803243893,another response,"));
    }
}
