//! Audit export.
//!
//! JSON is a pretty-printed array. CSV carries a fixed header with the
//! metadata column JSON-encoded and quoted.

use realmgate_core::error::{Error, Result};

use crate::event::AuditEvent;

/// Supported export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

const CSV_HEADER: &str =
    "id,eventType,timestamp,actorId,actorType,targetId,targetType,result,realmId,sessionId,metadata";

/// Render rows in the requested format
pub fn export(events: &[AuditEvent], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => serde_json::to_string_pretty(events)
            .map_err(|e| Error::internal(format!("audit export failed: {e}"))),
        ExportFormat::Csv => Ok(to_csv(events)),
    }
}

fn to_csv(events: &[AuditEvent]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');

    for event in events {
        let fields = [
            event.id.to_string(),
            event.event_type.clone(),
            event.timestamp.to_rfc3339(),
            event.actor_id.clone().unwrap_or_default(),
            format!("{:?}", event.actor_type).to_uppercase(),
            event.target_id.clone().unwrap_or_default(),
            event.target_type.clone().unwrap_or_default(),
            event.result.as_str().to_string(),
            event.realm.clone(),
            event.session_id.clone().unwrap_or_default(),
        ];

        let mut row: Vec<String> = fields.iter().map(|f| csv_quote(f)).collect();

        // The metadata column is JSON-encoded and always quoted, regardless
        // of content.
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string());
        row.push(csv_force_quote(&metadata));

        out.push_str(&row.join(","));
        out.push('\n');
    }

    out
}

/// Quote a CSV field only when its content requires it
fn csv_quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        csv_force_quote(field)
    } else {
        field.to_string()
    }
}

/// Quote unconditionally, doubling embedded quotes
fn csv_force_quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}
