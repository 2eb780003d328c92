//! Entity snapshots and their reducers
//!
//! Reducers are pure: they take the current snapshot and one data object
//! and return either the next snapshot or a rejection. Status transitions
//! are order-tolerant, each one stamping its own time regardless of the
//! prior status.

use serde::Serialize;

use lao_core::{EntityId, ProtocolError, ProtocolResult, PublicKey, Timestamp};
use lao_wire::{ElectionQuestion, ObjectKind, ProtocolData};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OrganizationState {
    pub id: EntityId,
    pub name: String,
    pub creation: Timestamp,
    pub last_modified: Timestamp,
    pub organizer: PublicKey,
    pub witnesses: Vec<PublicKey>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RollCallStatus {
    Created,
    Opened,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RollCallState {
    pub id: EntityId,
    pub name: String,
    pub creation: Timestamp,
    pub proposed_start: Timestamp,
    pub proposed_end: Timestamp,
    pub location: String,
    pub description: Option<String>,
    pub status: RollCallStatus,
    pub opened_at: Option<Timestamp>,
    pub closed_at: Option<Timestamp>,
    pub attendees: Vec<PublicKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MeetingState {
    pub id: EntityId,
    pub name: String,
    pub creation: Timestamp,
    pub last_modified: Timestamp,
    pub location: Option<String>,
    pub start: Timestamp,
    pub end: Option<Timestamp>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ElectionStatus {
    Created,
    Opened,
    Ended,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ElectionState {
    pub id: EntityId,
    pub name: String,
    pub version: String,
    pub created_at: Timestamp,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub questions: Vec<ElectionQuestion>,
    pub status: ElectionStatus,
    pub opened_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub registered_votes: Option<String>,
}

/// Authoritative state of one entity
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntitySnapshot {
    Organization(OrganizationState),
    RollCall(RollCallState),
    Meeting(MeetingState),
    Election(ElectionState),
}

impl EntitySnapshot {
    /// Initial snapshot carried by a Create; `None` for other data
    pub fn from_create(data: &ProtocolData) -> Option<Self> {
        let snapshot = match data {
            ProtocolData::CreateLao(d) => EntitySnapshot::Organization(OrganizationState {
                id: d.id,
                name: d.name.clone(),
                creation: d.creation,
                last_modified: d.creation,
                organizer: d.organizer,
                witnesses: d.witnesses.clone(),
            }),
            ProtocolData::CreateRollCall(d) => EntitySnapshot::RollCall(RollCallState {
                id: d.id,
                name: d.name.clone(),
                creation: d.creation,
                proposed_start: d.proposed_start,
                proposed_end: d.proposed_end,
                location: d.location.clone(),
                description: d.description.clone(),
                status: RollCallStatus::Created,
                opened_at: None,
                closed_at: None,
                attendees: Vec::new(),
            }),
            ProtocolData::CreateMeeting(d) => EntitySnapshot::Meeting(MeetingState {
                id: d.id,
                name: d.name.clone(),
                creation: d.creation,
                last_modified: d.creation,
                location: d.location.clone(),
                start: d.start,
                end: d.end,
            }),
            ProtocolData::SetupElection(d) => EntitySnapshot::Election(ElectionState {
                id: d.id,
                name: d.name.clone(),
                version: d.version.clone(),
                created_at: d.created_at,
                start_time: d.start_time,
                end_time: d.end_time,
                questions: d.questions.clone(),
                status: ElectionStatus::Created,
                opened_at: None,
                ended_at: None,
                registered_votes: None,
            }),
            _ => return None,
        };
        Some(snapshot)
    }

    pub fn id(&self) -> EntityId {
        match self {
            EntitySnapshot::Organization(s) => s.id,
            EntitySnapshot::RollCall(s) => s.id,
            EntitySnapshot::Meeting(s) => s.id,
            EntitySnapshot::Election(s) => s.id,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            EntitySnapshot::Organization(_) => ObjectKind::Lao,
            EntitySnapshot::RollCall(_) => ObjectKind::RollCall,
            EntitySnapshot::Meeting(_) => ObjectKind::Meeting,
            EntitySnapshot::Election(_) => ObjectKind::Election,
        }
    }

    /// Apply a modification, producing the next snapshot
    pub fn reduce(&self, data: &ProtocolData) -> ProtocolResult<Self> {
        let next = match (self, data) {
            (EntitySnapshot::Organization(s), ProtocolData::UpdateLao(d)) => {
                EntitySnapshot::Organization(OrganizationState {
                    name: d.name.clone(),
                    last_modified: d.last_modified,
                    witnesses: d.witnesses.clone(),
                    ..s.clone()
                })
            }
            (EntitySnapshot::Organization(s), ProtocolData::StateLao(d)) => {
                if d.organizer != s.organizer || d.creation != s.creation {
                    return Err(mismatch(self, data));
                }
                EntitySnapshot::Organization(OrganizationState {
                    name: d.name.clone(),
                    last_modified: d.last_modified,
                    witnesses: d.witnesses.clone(),
                    ..s.clone()
                })
            }
            (EntitySnapshot::RollCall(s), ProtocolData::OpenRollCall(d))
            | (EntitySnapshot::RollCall(s), ProtocolData::ReopenRollCall(d)) => {
                EntitySnapshot::RollCall(RollCallState {
                    status: RollCallStatus::Opened,
                    opened_at: Some(d.opened_at),
                    ..s.clone()
                })
            }
            (EntitySnapshot::RollCall(s), ProtocolData::CloseRollCall(d)) => {
                let mut attendees = d.attendees.clone();
                attendees.sort();
                attendees.dedup();
                EntitySnapshot::RollCall(RollCallState {
                    status: RollCallStatus::Closed,
                    closed_at: Some(d.closed_at),
                    attendees,
                    ..s.clone()
                })
            }
            (EntitySnapshot::Meeting(s), ProtocolData::StateMeeting(d)) => {
                if d.creation != s.creation {
                    return Err(mismatch(self, data));
                }
                EntitySnapshot::Meeting(MeetingState {
                    name: d.name.clone(),
                    last_modified: d.last_modified,
                    location: d.location.clone(),
                    start: d.start,
                    end: d.end,
                    ..s.clone()
                })
            }
            (EntitySnapshot::Election(s), ProtocolData::OpenElection(d)) => {
                // Ended elections are frozen
                if s.status == ElectionStatus::Ended {
                    self.clone()
                } else {
                    EntitySnapshot::Election(ElectionState {
                        status: ElectionStatus::Opened,
                        opened_at: Some(d.opened_at),
                        ..s.clone()
                    })
                }
            }
            (EntitySnapshot::Election(s), ProtocolData::EndElection(d)) => {
                EntitySnapshot::Election(ElectionState {
                    status: ElectionStatus::Ended,
                    ended_at: Some(d.created_at),
                    registered_votes: Some(d.registered_votes.clone()),
                    ..s.clone()
                })
            }
            _ => return Err(mismatch(self, data)),
        };
        Ok(next)
    }

    /// Witnesses declared by an organization snapshot
    pub fn declared_witnesses(&self) -> Option<&[PublicKey]> {
        match self {
            EntitySnapshot::Organization(s) => Some(&s.witnesses),
            _ => None,
        }
    }
}

fn mismatch(snapshot: &EntitySnapshot, data: &ProtocolData) -> ProtocolError {
    let (object, action) = data.kind();
    ProtocolError::MalformedData(format!(
        "{object}#{action} does not apply to {} {}",
        snapshot.kind(),
        snapshot.id()
    ))
}
