//! Trip journal reconstruction.
//!
//! [`build_journal`] folds an ordered stream of realtime snapshots into a
//! set of reconciled [`Trip`] records. Each snapshot carries the full list
//! of a trip's *future* stops; successive snapshots publish shrinking
//! suffixes of that list as the trip progresses. The builder reconciles
//! each update against the trip's accumulated stop sequence, marking stops
//! as past when a snapshot stops mentioning them, and counts schedule
//! changes and rewrites along the way.
//!
//! The builder itself never fails: it consumes whatever the source yields
//! and emits whatever trips it reconstructed.

pub mod snapshot;
pub mod source;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use self::snapshot::{StopTimeUpdate, TripUpdate};
use self::source::SnapshotSource;

/// The reconciled trips for one day, ascending by trip UID.
#[derive(Debug, Clone, PartialEq)]
pub struct Journal {
    pub trips: Vec<Trip>,
}

/// One reconciled service instance, accumulated across snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    /// Derived identifier, stable across snapshots and unique across days:
    /// the unix start time concatenated with the raw trip id past its
    /// six-digit time-of-day prefix.
    pub uid: String,
    pub trip_id: String,
    pub route_id: String,
    pub direction_id: Option<bool>,
    pub start_time: DateTime<Utc>,
    pub vehicle_id: Option<String>,
    pub is_assigned: bool,

    pub stop_times: Vec<StopTime>,

    pub last_observed: DateTime<Utc>,
    pub marked_past: Option<DateTime<Utc>>,
    pub num_updates: u32,
    pub num_schedule_changes: i32,
    pub num_schedule_rewrites: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopTime {
    pub stop_id: String,
    pub arrival_time: Option<DateTime<Utc>>,
    pub departure_time: Option<DateTime<Utc>>,
    pub track: Option<String>,

    pub last_observed: DateTime<Utc>,
    pub marked_past: Option<DateTime<Utc>>,
}

/// Derive the trip UID from a trip's start instant and raw feed id.
pub fn trip_uid(start_time: DateTime<Utc>, raw_id: &str) -> String {
    format!(
        "{}{}",
        start_time.timestamp(),
        raw_id.get(6..).unwrap_or_default()
    )
}

/// Fold the source into a journal of trips whose start time lies in
/// `[start, end)` and which were observed with an assigned vehicle.
pub fn build_journal(
    source: &mut dyn SnapshotSource,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Journal {
    let mut trips: HashMap<String, Trip> = HashMap::new();
    let mut active_uids: HashSet<String> = HashSet::new();

    while let Some(snapshot) = source.next() {
        let published_at = snapshot.published_at;
        let mut new_active_uids = HashSet::new();
        for update in &snapshot.trip_updates {
            let uid = trip_uid(update.start_time, &update.raw_id);
            trips
                .entry(uid.clone())
                .or_insert_with(|| Trip::fresh(update.start_time))
                .apply(update, published_at);
            new_active_uids.insert(uid);
        }
        // Trips the previous snapshot mentioned but this one does not have
        // left the feed; stamp them (and their stops) with this snapshot's
        // publish time.
        for uid in active_uids.difference(&new_active_uids) {
            if let Some(trip) = trips.get_mut(uid) {
                trip.mark_past(published_at);
            }
        }
        active_uids = new_active_uids;
    }

    let mut selected: Vec<Trip> = trips
        .into_values()
        .filter(|trip| trip.is_assigned && trip.start_time >= start && trip.start_time < end)
        .collect();
    selected.sort_by(|a, b| a.uid.cmp(&b.uid));
    Journal { trips: selected }
}

impl Trip {
    fn fresh(start_time: DateTime<Utc>) -> Trip {
        Trip {
            uid: String::new(),
            trip_id: String::new(),
            route_id: String::new(),
            direction_id: None,
            start_time,
            vehicle_id: None,
            is_assigned: false,
            stop_times: Vec::new(),
            last_observed: DateTime::UNIX_EPOCH,
            marked_past: None,
            num_updates: 0,
            // The first observation always introduces stops and rewrites the
            // (empty) schedule; starting at -1 keeps it out of the counts.
            num_schedule_changes: -1,
            num_schedule_rewrites: -1,
        }
    }

    fn apply(&mut self, update: &TripUpdate, published_at: DateTime<Utc>) {
        if self.is_assigned && !update.is_assigned {
            // Assigned trips occasionally show up without their vehicle for
            // a snapshot or two; those updates are noise.
            return;
        }

        self.uid = trip_uid(update.start_time, &update.raw_id);
        self.trip_id = update.raw_id.clone();
        self.route_id = update.route_id.clone();
        self.direction_id = update.direction_id;
        self.start_time = update.start_time;
        self.vehicle_id = update.vehicle_id.clone();
        self.is_assigned = self.is_assigned || update.is_assigned;

        self.last_observed = published_at;
        self.marked_past = None;
        self.num_updates += 1;

        let updates = &update.stop_time_updates;
        let (past_len, updated_len) = partition(&self.stop_times, updates);

        for stop_time in &mut self.stop_times[..past_len] {
            stop_time.mark_past(published_at);
        }
        for (stop_time, stop_update) in self.stop_times[past_len..past_len + updated_len]
            .iter_mut()
            .zip(updates)
        {
            stop_time.apply(stop_update, published_at);
        }

        // Drop stops made obsolete by a schedule change.
        self.stop_times.truncate(past_len + updated_len);
        if self.stop_times.is_empty() {
            self.num_schedule_rewrites += 1;
        }

        for stop_update in &updates[updated_len..] {
            self.stop_times
                .push(StopTime::from_update(stop_update, published_at));
        }
        if updated_len < updates.len() {
            self.num_schedule_changes += 1;
        }
    }

    fn mark_past(&mut self, published_at: DateTime<Utc>) {
        if self.marked_past.is_none() {
            self.marked_past = Some(published_at);
        }
        for stop_time in &mut self.stop_times {
            stop_time.mark_past(published_at);
        }
    }
}

impl StopTime {
    fn from_update(update: &StopTimeUpdate, published_at: DateTime<Utc>) -> StopTime {
        StopTime {
            stop_id: update.stop_id.clone(),
            arrival_time: update.arrival_time,
            departure_time: update.departure_time,
            track: update.track.clone(),
            last_observed: published_at,
            marked_past: None,
        }
    }

    fn apply(&mut self, update: &StopTimeUpdate, published_at: DateTime<Utc>) {
        self.stop_id = update.stop_id.clone();
        self.arrival_time = update.arrival_time;
        self.departure_time = update.departure_time;
        self.track = update.track.clone();
        self.last_observed = published_at;
        self.marked_past = None;
    }

    // Idempotent: the first snapshot that stops mentioning the stop wins.
    fn mark_past(&mut self, published_at: DateTime<Utc>) {
        if self.marked_past.is_none() {
            self.marked_past = Some(published_at);
        }
    }
}

/// Split a trip's accumulated stop times against a new update list.
///
/// Returns `(past_len, updated_len)`: the first `past_len` existing stops
/// are no longer mentioned and become past; the next `updated_len` pair up
/// positionally with the head of `updates`; everything after
/// `updates[updated_len..]` is new. When the first updated stop does not
/// appear in the existing sequence the split starts at index 0, which turns
/// the update into a full schedule rewrite.
fn partition(stop_times: &[StopTime], updates: &[StopTimeUpdate]) -> (usize, usize) {
    if updates.is_empty() {
        return (stop_times.len(), 0);
    }
    let first_stop_id = &updates[0].stop_id;
    let past_len = stop_times
        .iter()
        .position(|stop_time| stop_time.stop_id == *first_stop_id)
        .unwrap_or(0);
    let updated_len = stop_times[past_len..]
        .iter()
        .zip(updates)
        .take_while(|(stop_time, update)| stop_time.stop_id == update.stop_id)
        .count();
    (past_len, updated_len)
}
