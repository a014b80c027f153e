//! RSS 2.0 feed of the chronological event stream.
//!
//! The feed is a startup-discovered feature: it needs the configured
//! absolute base URL for its links, so without `[crab] base_url` the
//! endpoint answers 404 rather than serving relative links.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crab_core::{EventRecord, JobRecord};

use crate::app::AppState;
use crate::http::ApiError;

const FEED_ITEM_COUNT: u32 = 40;

pub async fn feed_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.feed_enabled {
        return Err(ApiError::NotFound("feed is not configured".to_string()));
    }
    let base_url = state
        .config
        .base_url()
        .unwrap_or_default();

    let events = state.store.get_feed_events(FEED_ITEM_COUNT)?;
    let body = render_rss(&base_url, &events);
    Ok((
        [(header::CONTENT_TYPE, "application/rss+xml; charset=utf-8")],
        body,
    ))
}

fn render_rss(base_url: &str, events: &[(JobRecord, EventRecord)]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<rss version=\"2.0\"><channel>\n");
    out.push_str("<title>crab job events</title>\n");
    out.push_str(&format!("<link>{}</link>\n", escape(base_url)));
    out.push_str("<description>Recent cron job lifecycle events</description>\n");

    for (job, event) in events {
        let name = job.crabid.as_deref().unwrap_or(&job.command);
        let status = event
            .status
            .map(|code| format!(" status={code}"))
            .unwrap_or_default();
        let title = format!("{} on {}: {}{}", name, job.host, event.kind, status);
        out.push_str("<item>\n");
        out.push_str(&format!("<title>{}</title>\n", escape(&title)));
        out.push_str(&format!(
            "<link>{}/api/0/job/{}</link>\n",
            escape(base_url),
            job.id
        ));
        out.push_str(&format!("<guid isPermaLink=\"false\">crab-event-{}</guid>\n", event.id));
        out.push_str(&format!("<pubDate>{}</pubDate>\n", event.datetime.to_rfc2822()));
        out.push_str("</item>\n");
    }

    out.push_str("</channel></rss>\n");
    out
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crab_core::EventKind;

    #[test]
    fn rss_escapes_markup_in_commands() {
        let job = JobRecord {
            id: 1,
            host: "hostA".to_string(),
            crabid: None,
            command: "echo '<hi>' && true".to_string(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            retired: None,
            inhibited: false,
        };
        let event = EventRecord {
            id: 9,
            jobid: 1,
            kind: EventKind::Finish,
            datetime: Utc::now(),
            status: Some(0),
            synthetic_key: None,
        };

        let xml = render_rss("http://example.com/crab", &[(job, event)]);
        assert!(xml.contains("&lt;hi&gt;"));
        assert!(xml.contains("&amp;&amp;"));
        assert!(xml.contains("crab-event-9"));
        assert!(!xml.contains("<hi>"));
    }
}
