//! Decoded realtime feed messages.
//!
//! The journal builder never touches protobuf. It consumes [`Snapshot`]
//! values, a minimal decoded form of one GTFS-RT feed message: the publish
//! instant plus the trip updates the message carried. [`Snapshot::decode`]
//! adapts a raw protobuf payload into this model; test code constructs
//! snapshots directly.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use prost::Message;

use crate::day::Day;

/// One realtime feed message, timestamped at publish time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub published_at: DateTime<Utc>,
    pub trip_updates: Vec<TripUpdate>,
}

/// A single trip's update within a snapshot.
#[derive(Debug, Clone)]
pub struct TripUpdate {
    /// The trip identifier as published in the feed.
    pub raw_id: String,
    pub route_id: String,
    pub direction_id: Option<bool>,
    /// Scheduled start instant: the trip's start date at local midnight plus
    /// its start time-of-day.
    pub start_time: DateTime<Utc>,
    pub vehicle_id: Option<String>,
    /// Whether the update carried a vehicle descriptor, i.e. the trip has
    /// been assigned physical equipment.
    pub is_assigned: bool,
    pub stop_time_updates: Vec<StopTimeUpdate>,
}

#[derive(Debug, Clone)]
pub struct StopTimeUpdate {
    pub stop_id: String,
    pub arrival_time: Option<DateTime<Utc>>,
    pub departure_time: Option<DateTime<Utc>>,
    pub track: Option<String>,
}

impl Snapshot {
    /// Decode a raw GTFS-RT protobuf payload.
    ///
    /// Returns `None` when the payload is not a feed message or lacks a
    /// header timestamp; callers treat that as a skippable bad file. Trip
    /// updates missing the fields needed to derive a trip identity (trip id,
    /// start date, start time) are dropped individually.
    pub fn decode(bytes: &[u8], tz: Tz) -> Option<Snapshot> {
        let feed = gtfs_realtime::FeedMessage::decode(bytes).ok()?;
        let published_at = DateTime::from_timestamp(feed.header.timestamp? as i64, 0)?;

        let mut trip_updates = Vec::new();
        for entity in feed.entity {
            let Some(update) = entity.trip_update else {
                continue;
            };
            let Some(decoded) = decode_trip_update(update, tz) else {
                continue;
            };
            trip_updates.push(decoded);
        }
        Some(Snapshot {
            published_at,
            trip_updates,
        })
    }
}

fn decode_trip_update(update: gtfs_realtime::TripUpdate, tz: Tz) -> Option<TripUpdate> {
    let gtfs_realtime::TripUpdate {
        trip: descriptor,
        vehicle,
        stop_time_update,
        ..
    } = update;
    let start_day: Day = parse_start_date(descriptor.start_date.as_deref()?)?;
    let start_offset = parse_start_time(descriptor.start_time.as_deref()?)?;
    let start_time = start_day.start(tz) + start_offset;

    let is_assigned = vehicle.is_some();
    let vehicle_id = vehicle.and_then(|v| v.id);

    let stop_time_updates = stop_time_update
        .into_iter()
        .filter_map(decode_stop_time_update)
        .collect();

    Some(TripUpdate {
        raw_id: descriptor.trip_id?,
        route_id: descriptor.route_id.unwrap_or_default(),
        direction_id: descriptor.direction_id.map(|d| d != 0),
        start_time,
        vehicle_id,
        is_assigned,
        stop_time_updates,
    })
}

fn decode_stop_time_update(
    update: gtfs_realtime::trip_update::StopTimeUpdate,
) -> Option<StopTimeUpdate> {
    let stop_id = update.stop_id?;
    let event_time = |event: &Option<gtfs_realtime::trip_update::StopTimeEvent>| {
        event
            .as_ref()
            .and_then(|e| e.time)
            .and_then(|t| DateTime::from_timestamp(t, 0))
    };
    // Track assignments ride on the stop's assigned-stop property; feeds
    // without it leave the column empty.
    let track = update
        .stop_time_properties
        .as_ref()
        .and_then(|p| p.assigned_stop_id.clone());
    Some(StopTimeUpdate {
        stop_id,
        arrival_time: event_time(&update.arrival),
        departure_time: event_time(&update.departure),
        track,
    })
}

/// `YYYYMMDD`, as published in GTFS-RT trip descriptors.
fn parse_start_date(s: &str) -> Option<Day> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = s[0..4].parse().ok()?;
    let month: u32 = s[4..6].parse().ok()?;
    let day: u32 = s[6..8].parse().ok()?;
    Day::new(year, month, day)
}

/// `HH:MM:SS` time-of-day, as an offset from local midnight. Hours may
/// exceed 23 for trips scheduled past midnight.
fn parse_start_time(s: &str) -> Option<Duration> {
    let mut parts = s.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
        return None;
    }
    Some(Duration::seconds(hours * 3600 + minutes * 60 + seconds))
}
