use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use concierge_core::ToolArguments;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::tools::{decode_arguments, Tool, ToolError};

const STORED_FORMAT: &str = "%Y-%m-%dT%H:%M";
const DEFAULT_DURATION_MINUTES: f64 = 60.0;

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("could not access calendar store `{path}`: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("could not encode calendar store: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{field} must be ISO format, e.g. '2025-11-05T10:00' (got `{value}`)")]
    InvalidDateTime { field: &'static str, value: String },
    #[error("duration_minutes must be a positive whole number (got {0})")]
    InvalidDuration(f64),
    #[error("duration_minutes {0} puts the event end outside the supported calendar range")]
    DurationOutOfRange(f64),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub title: String,
    pub start: String,
    pub end: String,
    pub duration: i64,
}

/// A date-time argument, remembering whether the caller gave a time of day.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ParsedMoment {
    at: NaiveDateTime,
    date_only: bool,
}

fn parse_moment(field: &'static str, value: &str) -> Result<ParsedMoment, CalendarError> {
    let trimmed = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(ParsedMoment { at: date.and_time(NaiveTime::MIN), date_only: true });
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"]
    {
        if let Ok(at) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(ParsedMoment { at, date_only: false });
        }
    }
    Err(CalendarError::InvalidDateTime { field, value: value.to_owned() })
}

fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_micro_opt(23, 59, 59, 999_999).unwrap_or_else(|| date.and_time(NaiveTime::MIN))
}

/// JSON-file event store. Writers are serialised by an in-process lock.
#[derive(Debug)]
pub struct CalendarStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CalendarStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<CalendarEvent>, CalendarError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(CalendarError::Io { path: self.path.clone(), source }),
        };
        match serde_json::from_str(&raw) {
            Ok(events) => Ok(events),
            Err(error) => {
                warn!(
                    event_name = "calendar.store_unreadable",
                    path = %self.path.display(),
                    error = %error,
                    "calendar store is not valid JSON; treating as empty"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, events: &[CalendarEvent]) -> Result<(), CalendarError> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CalendarError::Io { path: parent.to_path_buf(), source })?;
        }
        let body = serde_json::to_string_pretty(events)?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|source| CalendarError::Io { path: self.path.clone(), source })
    }

    /// Events whose start falls within `[start_date, end_date]`, sorted by start. A date-only
    /// `end_date` covers that whole day.
    pub async fn list_events(
        &self,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        let start = match start_date {
            Some(value) => Some(parse_moment("start_date", value)?.at),
            None => None,
        };
        let end = match end_date {
            Some(value) => {
                let moment = parse_moment("end_date", value)?;
                Some(if moment.date_only { end_of_day(moment.at.date()) } else { moment.at })
            }
            None => None,
        };

        let _guard = self.lock.lock().await;
        let mut matching: Vec<(NaiveDateTime, CalendarEvent)> = self
            .load()
            .await?
            .into_iter()
            .filter_map(|event| match parse_moment("start", &event.start) {
                Ok(moment) => Some((moment.at, event)),
                Err(_) => {
                    warn!(event_name = "calendar.event_skipped", title = %event.title, start = %event.start, "stored event has an unreadable start");
                    None
                }
            })
            .filter(|(at, _)| start.map_or(true, |start| *at >= start))
            .filter(|(at, _)| end.map_or(true, |end| *at <= end))
            .collect();
        matching.sort_by(|left, right| left.0.cmp(&right.0));
        Ok(matching.into_iter().map(|(_, event)| event).collect())
    }

    pub async fn create_event(
        &self,
        title: &str,
        start_time: &str,
        duration_minutes: f64,
    ) -> Result<CalendarEvent, CalendarError> {
        let start = parse_moment("start_time", start_time)?.at;
        if !duration_minutes.is_finite() || duration_minutes <= 0.0 || duration_minutes.fract() != 0.0
        {
            return Err(CalendarError::InvalidDuration(duration_minutes));
        }
        let duration = duration_minutes as i64;
        let end = Duration::try_minutes(duration)
            .and_then(|span| start.checked_add_signed(span))
            .ok_or(CalendarError::DurationOutOfRange(duration_minutes))?;
        let event = CalendarEvent {
            title: title.to_owned(),
            start: start.format(STORED_FORMAT).to_string(),
            end: end.format(STORED_FORMAT).to_string(),
            duration,
        };

        let _guard = self.lock.lock().await;
        let mut events = self.load().await?;
        events.push(event.clone());
        self.save(&events).await?;
        info!(event_name = "calendar.event_created", title = %event.title, start = %event.start, "calendar event created");
        Ok(event)
    }

    pub async fn clear_events(&self) -> Result<usize, CalendarError> {
        let _guard = self.lock.lock().await;
        let removed = self.load().await?.len();
        self.save(&[]).await?;
        info!(event_name = "calendar.cleared", removed, "calendar cleared");
        Ok(removed)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListEventsArgs {
    start_date: Option<String>,
    end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateEventArgs {
    title: String,
    start_time: String,
    duration_minutes: Option<f64>,
}

pub struct ListEventsTool {
    store: Arc<CalendarStore>,
}

impl ListEventsTool {
    pub fn new(store: Arc<CalendarStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ListEventsTool {
    fn name(&self) -> &'static str {
        "list_events"
    }

    fn description(&self) -> &'static str {
        "List calendar events, optionally between a start and end date (inclusive)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "start_date": {
                    "type": "string",
                    "description": "The start date of the events to list, e.g. '2025-11-01'"
                },
                "end_date": {
                    "type": "string",
                    "description": "The end date of the events to list, e.g. '2025-11-30'"
                }
            }
        })
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError> {
        let args: ListEventsArgs = decode_arguments(self.name(), arguments)?;
        let events =
            self.store.list_events(args.start_date.as_deref(), args.end_date.as_deref()).await?;
        Ok(serde_json::to_value(events).map_err(CalendarError::from)?)
    }
}

pub struct CreateEventTool {
    store: Arc<CalendarStore>,
}

impl CreateEventTool {
    pub fn new(store: Arc<CalendarStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for CreateEventTool {
    fn name(&self) -> &'static str {
        "create_event"
    }

    fn description(&self) -> &'static str {
        "Create a new event in the calendar"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "The title of the event, e.g. 'Meeting with John'"
                },
                "start_time": {
                    "type": "string",
                    "description": "The start time of the event, e.g. '2025-11-01T10:00'"
                },
                "duration_minutes": {
                    "type": "number",
                    "description": "The duration of the event in minutes (default 60)"
                }
            },
            "required": ["title", "start_time"]
        })
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError> {
        let args: CreateEventArgs = decode_arguments(self.name(), arguments)?;
        let event = self
            .store
            .create_event(
                &args.title,
                &args.start_time,
                args.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES),
            )
            .await?;
        Ok(serde_json::to_value(event).map_err(CalendarError::from)?)
    }
}

pub struct ClearEventsTool {
    store: Arc<CalendarStore>,
}

impl ClearEventsTool {
    pub fn new(store: Arc<CalendarStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ClearEventsTool {
    fn name(&self) -> &'static str {
        "clear_events"
    }

    fn description(&self) -> &'static str {
        "Clear all events from the calendar"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}, "required": []})
    }

    async fn execute(&self, _arguments: ToolArguments) -> Result<Value, ToolError> {
        let removed = self.store.clear_events().await?;
        Ok(json!({ "cleared": removed }))
    }
}
