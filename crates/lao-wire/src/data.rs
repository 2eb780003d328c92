//! Protocol data - the typed content of a signed envelope
//!
//! Decoding goes through an explicit table keyed by the `(object, action)`
//! string pair. Unknown pairs, missing fields and semantically invalid
//! payloads are all `MalformedData`.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use lao_core::{
    Channel, EntityId, MessageId, ProtocolError, ProtocolResult, PublicKey, Signature, Timestamp,
};

/// Object kind as carried in the `object` field
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Lao,
    RollCall,
    Meeting,
    Election,
    Message,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Lao => "lao",
            ObjectKind::RollCall => "roll_call",
            ObjectKind::Meeting => "meeting",
            ObjectKind::Election => "election",
            ObjectKind::Message => "message",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action kind as carried in the `action` field
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Create,
    UpdateProperties,
    State,
    Open,
    Reopen,
    Close,
    Setup,
    End,
    Witness,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::UpdateProperties => "update_properties",
            ActionKind::State => "state",
            ActionKind::Open => "open",
            ActionKind::Reopen => "reopen",
            ActionKind::Close => "close",
            ActionKind::Setup => "setup",
            ActionKind::End => "end",
            ActionKind::Witness => "witness",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a data object participates in reconciliation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataRole {
    /// Brings an entity into existence
    Create,
    /// Proposes a new snapshot, subject to quorum
    Modify,
    /// Attests another message
    Witness,
}

/// Entity identifier derivation, one function per entity kind
pub mod ids {
    use super::*;

    /// `H(organizer, creation, name)`
    pub fn lao(organizer: &PublicKey, creation: Timestamp, name: &str) -> EntityId {
        EntityId::compute([
            organizer.to_base64(),
            creation.to_id_field(),
            name.to_string(),
        ])
    }

    /// `H("R", laoId, creation, name)`
    pub fn roll_call(lao_id: &EntityId, creation: Timestamp, name: &str) -> EntityId {
        EntityId::compute(["R", lao_id.as_str(), creation.to_id_field().as_str(), name])
    }

    /// `H("R", laoId, target, at)` for roll-call open, reopen and close
    pub fn roll_call_update(lao_id: &EntityId, target: &EntityId, at: Timestamp) -> EntityId {
        EntityId::compute(["R", lao_id.as_str(), target.as_str(), at.to_id_field().as_str()])
    }

    /// `H("M", laoId, creation, name)`
    pub fn meeting(lao_id: &EntityId, creation: Timestamp, name: &str) -> EntityId {
        EntityId::compute(["M", lao_id.as_str(), creation.to_id_field().as_str(), name])
    }

    /// `H("Election", laoId, created_at, name)`
    pub fn election(lao_id: &EntityId, created_at: Timestamp, name: &str) -> EntityId {
        EntityId::compute([
            "Election",
            lao_id.as_str(),
            created_at.to_id_field().as_str(),
            name,
        ])
    }
}

/// Witness signature over a modification id, aggregated into state messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationSignature {
    pub witness: PublicKey,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLao {
    pub id: EntityId,
    pub name: String,
    pub creation: Timestamp,
    pub organizer: PublicKey,
    pub witnesses: Vec<PublicKey>,
}

impl CreateLao {
    pub fn new(
        organizer: PublicKey,
        name: impl Into<String>,
        creation: Timestamp,
        witnesses: Vec<PublicKey>,
    ) -> Self {
        let name = name.into();
        CreateLao {
            id: ids::lao(&organizer, creation, &name),
            name,
            creation,
            organizer,
            witnesses,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLao {
    pub id: EntityId,
    pub name: String,
    pub last_modified: Timestamp,
    pub witnesses: Vec<PublicKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLao {
    pub id: EntityId,
    pub name: String,
    pub creation: Timestamp,
    pub last_modified: Timestamp,
    pub organizer: PublicKey,
    pub witnesses: Vec<PublicKey>,
    pub modification_id: MessageId,
    pub modification_signatures: Vec<ModificationSignature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRollCall {
    pub id: EntityId,
    pub name: String,
    pub creation: Timestamp,
    pub proposed_start: Timestamp,
    pub proposed_end: Timestamp,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CreateRollCall {
    pub fn new(
        lao_id: &EntityId,
        name: impl Into<String>,
        creation: Timestamp,
        proposed_start: Timestamp,
        proposed_end: Timestamp,
        location: impl Into<String>,
    ) -> Self {
        let name = name.into();
        CreateRollCall {
            id: ids::roll_call(lao_id, creation, &name),
            name,
            creation,
            proposed_start,
            proposed_end,
            location: location.into(),
            description: None,
        }
    }
}

/// Roll-call open and reopen share one shape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRollCall {
    pub update_id: EntityId,
    pub opens: EntityId,
    pub opened_at: Timestamp,
}

impl OpenRollCall {
    pub fn new(lao_id: &EntityId, opens: EntityId, opened_at: Timestamp) -> Self {
        OpenRollCall {
            update_id: ids::roll_call_update(lao_id, &opens, opened_at),
            opens,
            opened_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRollCall {
    pub update_id: EntityId,
    pub closes: EntityId,
    pub closed_at: Timestamp,
    pub attendees: Vec<PublicKey>,
}

impl CloseRollCall {
    pub fn new(
        lao_id: &EntityId,
        closes: EntityId,
        closed_at: Timestamp,
        attendees: Vec<PublicKey>,
    ) -> Self {
        CloseRollCall {
            update_id: ids::roll_call_update(lao_id, &closes, closed_at),
            closes,
            closed_at,
            attendees,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMeeting {
    pub id: EntityId,
    pub name: String,
    pub creation: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub start: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Timestamp>,
}

impl CreateMeeting {
    pub fn new(lao_id: &EntityId, name: impl Into<String>, creation: Timestamp, start: Timestamp) -> Self {
        let name = name.into();
        CreateMeeting {
            id: ids::meeting(lao_id, creation, &name),
            name,
            creation,
            location: None,
            start,
            end: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMeeting {
    pub id: EntityId,
    pub name: String,
    pub creation: Timestamp,
    pub last_modified: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub start: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Timestamp>,
    pub modification_id: MessageId,
    pub modification_signatures: Vec<ModificationSignature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionQuestion {
    pub id: String,
    pub question: String,
    pub voting_method: String,
    pub ballot_options: Vec<String>,
    #[serde(default)]
    pub write_in: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupElection {
    pub id: EntityId,
    pub lao: EntityId,
    pub name: String,
    pub version: String,
    pub created_at: Timestamp,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub questions: Vec<ElectionQuestion>,
}

impl SetupElection {
    pub fn new(
        lao_id: &EntityId,
        name: impl Into<String>,
        created_at: Timestamp,
        start_time: Timestamp,
        end_time: Timestamp,
    ) -> Self {
        let name = name.into();
        SetupElection {
            id: ids::election(lao_id, created_at, &name),
            lao: *lao_id,
            name,
            version: "OPEN_BALLOT".to_string(),
            created_at,
            start_time,
            end_time,
            questions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenElection {
    pub lao: EntityId,
    pub election: EntityId,
    pub opened_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndElection {
    pub lao: EntityId,
    pub election: EntityId,
    pub created_at: Timestamp,
    #[serde(default)]
    pub registered_votes: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessMessage {
    pub message_id: MessageId,
    pub signature: Signature,
}

/// Typed protocol data
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolData {
    CreateLao(CreateLao),
    UpdateLao(UpdateLao),
    StateLao(StateLao),
    CreateRollCall(CreateRollCall),
    OpenRollCall(OpenRollCall),
    ReopenRollCall(OpenRollCall),
    CloseRollCall(CloseRollCall),
    CreateMeeting(CreateMeeting),
    StateMeeting(StateMeeting),
    SetupElection(SetupElection),
    OpenElection(OpenElection),
    EndElection(EndElection),
    Witness(WitnessMessage),
}

fn field<T: DeserializeOwned>(
    object: &str,
    action: &str,
    fields: Map<String, Value>,
) -> ProtocolResult<T> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| ProtocolError::MalformedData(format!("{object}#{action}: {e}")))
}

fn malformed(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedData(msg.into())
}

impl ProtocolData {
    /// Decode payload bytes through the `(object, action)` table
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| malformed(format!("payload is not JSON: {e}")))?;
        let Value::Object(mut fields) = value else {
            return Err(malformed("payload is not a JSON object"));
        };

        let object = take_tag(&mut fields, "object")?;
        let action = take_tag(&mut fields, "action")?;
        let (o, a) = (object.as_str(), action.as_str());

        let data = match (o, a) {
            ("lao", "create") => ProtocolData::CreateLao(field(o, a, fields)?),
            ("lao", "update_properties") => ProtocolData::UpdateLao(field(o, a, fields)?),
            ("lao", "state") => ProtocolData::StateLao(field(o, a, fields)?),
            ("roll_call", "create") => ProtocolData::CreateRollCall(field(o, a, fields)?),
            ("roll_call", "open") => ProtocolData::OpenRollCall(field(o, a, fields)?),
            ("roll_call", "reopen") => ProtocolData::ReopenRollCall(field(o, a, fields)?),
            ("roll_call", "close") => ProtocolData::CloseRollCall(field(o, a, fields)?),
            ("meeting", "create") => ProtocolData::CreateMeeting(field(o, a, fields)?),
            ("meeting", "state") => ProtocolData::StateMeeting(field(o, a, fields)?),
            ("election", "setup") => ProtocolData::SetupElection(field(o, a, fields)?),
            ("election", "open") => ProtocolData::OpenElection(field(o, a, fields)?),
            ("election", "end") => ProtocolData::EndElection(field(o, a, fields)?),
            ("message", "witness") => ProtocolData::Witness(field(o, a, fields)?),
            _ => return Err(malformed(format!("unknown object/action pair {o}#{a}"))),
        };

        data.check_fields()?;
        Ok(data)
    }

    /// Encode to payload bytes, tags included
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let value = match self {
            ProtocolData::CreateLao(d) => serde_json::to_value(d),
            ProtocolData::UpdateLao(d) => serde_json::to_value(d),
            ProtocolData::StateLao(d) => serde_json::to_value(d),
            ProtocolData::CreateRollCall(d) => serde_json::to_value(d),
            ProtocolData::OpenRollCall(d) | ProtocolData::ReopenRollCall(d) => {
                serde_json::to_value(d)
            }
            ProtocolData::CloseRollCall(d) => serde_json::to_value(d),
            ProtocolData::CreateMeeting(d) => serde_json::to_value(d),
            ProtocolData::StateMeeting(d) => serde_json::to_value(d),
            ProtocolData::SetupElection(d) => serde_json::to_value(d),
            ProtocolData::OpenElection(d) => serde_json::to_value(d),
            ProtocolData::EndElection(d) => serde_json::to_value(d),
            ProtocolData::Witness(d) => serde_json::to_value(d),
        }
        .map_err(|e| malformed(e.to_string()))?;

        let Value::Object(mut fields) = value else {
            return Err(malformed("data did not encode to an object"));
        };
        let (object, action) = self.kind();
        fields.insert("object".into(), Value::String(object.as_str().into()));
        fields.insert("action".into(), Value::String(action.as_str().into()));

        serde_json::to_vec(&Value::Object(fields)).map_err(|e| malformed(e.to_string()))
    }

    /// Routing tag
    pub fn kind(&self) -> (ObjectKind, ActionKind) {
        use ActionKind as A;
        use ObjectKind as O;
        match self {
            ProtocolData::CreateLao(_) => (O::Lao, A::Create),
            ProtocolData::UpdateLao(_) => (O::Lao, A::UpdateProperties),
            ProtocolData::StateLao(_) => (O::Lao, A::State),
            ProtocolData::CreateRollCall(_) => (O::RollCall, A::Create),
            ProtocolData::OpenRollCall(_) => (O::RollCall, A::Open),
            ProtocolData::ReopenRollCall(_) => (O::RollCall, A::Reopen),
            ProtocolData::CloseRollCall(_) => (O::RollCall, A::Close),
            ProtocolData::CreateMeeting(_) => (O::Meeting, A::Create),
            ProtocolData::StateMeeting(_) => (O::Meeting, A::State),
            ProtocolData::SetupElection(_) => (O::Election, A::Setup),
            ProtocolData::OpenElection(_) => (O::Election, A::Open),
            ProtocolData::EndElection(_) => (O::Election, A::End),
            ProtocolData::Witness(_) => (O::Message, A::Witness),
        }
    }

    pub fn role(&self) -> DataRole {
        match self {
            ProtocolData::CreateLao(_)
            | ProtocolData::CreateRollCall(_)
            | ProtocolData::CreateMeeting(_)
            | ProtocolData::SetupElection(_) => DataRole::Create,
            ProtocolData::Witness(_) => DataRole::Witness,
            _ => DataRole::Modify,
        }
    }

    /// Entity a Create brings up or a Modify targets.
    ///
    /// For roll-call open/close this is the referenced id, which may be an
    /// earlier update id rather than the roll-call itself.
    pub fn target(&self) -> Option<EntityId> {
        match self {
            ProtocolData::CreateLao(d) => Some(d.id),
            ProtocolData::UpdateLao(d) => Some(d.id),
            ProtocolData::StateLao(d) => Some(d.id),
            ProtocolData::CreateRollCall(d) => Some(d.id),
            ProtocolData::OpenRollCall(d) | ProtocolData::ReopenRollCall(d) => Some(d.opens),
            ProtocolData::CloseRollCall(d) => Some(d.closes),
            ProtocolData::CreateMeeting(d) => Some(d.id),
            ProtocolData::StateMeeting(d) => Some(d.id),
            ProtocolData::SetupElection(d) => Some(d.id),
            ProtocolData::OpenElection(d) => Some(d.election),
            ProtocolData::EndElection(d) => Some(d.election),
            ProtocolData::Witness(_) => None,
        }
    }

    /// Update id a roll-call transition introduces
    pub fn update_id(&self) -> Option<EntityId> {
        match self {
            ProtocolData::OpenRollCall(d) | ProtocolData::ReopenRollCall(d) => Some(d.update_id),
            ProtocolData::CloseRollCall(d) => Some(d.update_id),
            _ => None,
        }
    }

    /// Protocol time this data takes effect at; `None` for witnesses
    pub fn last_modified(&self) -> Option<Timestamp> {
        match self {
            ProtocolData::CreateLao(d) => Some(d.creation),
            ProtocolData::UpdateLao(d) => Some(d.last_modified),
            ProtocolData::StateLao(d) => Some(d.last_modified),
            ProtocolData::CreateRollCall(d) => Some(d.creation),
            ProtocolData::OpenRollCall(d) | ProtocolData::ReopenRollCall(d) => Some(d.opened_at),
            ProtocolData::CloseRollCall(d) => Some(d.closed_at),
            ProtocolData::CreateMeeting(d) => Some(d.creation),
            ProtocolData::StateMeeting(d) => Some(d.last_modified),
            ProtocolData::SetupElection(d) => Some(d.created_at),
            ProtocolData::OpenElection(d) => Some(d.opened_at),
            ProtocolData::EndElection(d) => Some(d.created_at),
            ProtocolData::Witness(_) => None,
        }
    }

    /// Aggregated signatures of a state message over its `modification_id`
    pub fn modification_signatures(&self) -> Option<(MessageId, &[ModificationSignature])> {
        match self {
            ProtocolData::StateLao(d) => Some((d.modification_id, &d.modification_signatures)),
            ProtocolData::StateMeeting(d) => {
                Some((d.modification_id, &d.modification_signatures))
            }
            _ => None,
        }
    }

    /// Context-free checks run at decode time
    fn check_fields(&self) -> ProtocolResult<()> {
        match self {
            ProtocolData::CreateLao(d) => {
                non_empty("name", &d.name)?;
                non_negative("creation", d.creation)?;
                if ids::lao(&d.organizer, d.creation, &d.name) != d.id {
                    return Err(malformed("lao id does not match its fields"));
                }
            }
            ProtocolData::UpdateLao(d) => {
                non_empty("name", &d.name)?;
                non_negative("last_modified", d.last_modified)?;
            }
            ProtocolData::StateLao(d) => {
                non_empty("name", &d.name)?;
                non_negative("creation", d.creation)?;
                // The id keeps the name given at creation
                not_before("last_modified", d.last_modified, d.creation)?;
            }
            ProtocolData::CreateRollCall(d) => {
                non_empty("name", &d.name)?;
                non_negative("creation", d.creation)?;
                not_before("proposed_start", d.proposed_start, d.creation)?;
                not_before("proposed_end", d.proposed_end, d.proposed_start)?;
            }
            ProtocolData::OpenRollCall(d) | ProtocolData::ReopenRollCall(d) => {
                non_negative("opened_at", d.opened_at)?;
            }
            ProtocolData::CloseRollCall(d) => {
                non_negative("closed_at", d.closed_at)?;
            }
            ProtocolData::CreateMeeting(d) => {
                non_empty("name", &d.name)?;
                non_negative("creation", d.creation)?;
                not_before("start", d.start, d.creation)?;
                if let Some(end) = d.end {
                    not_before("end", end, d.start)?;
                }
            }
            ProtocolData::StateMeeting(d) => {
                non_empty("name", &d.name)?;
                non_negative("creation", d.creation)?;
                not_before("last_modified", d.last_modified, d.creation)?;
            }
            ProtocolData::SetupElection(d) => {
                non_empty("name", &d.name)?;
                non_negative("created_at", d.created_at)?;
                not_before("end_time", d.end_time, d.start_time)?;
            }
            ProtocolData::OpenElection(d) => non_negative("opened_at", d.opened_at)?,
            ProtocolData::EndElection(d) => non_negative("created_at", d.created_at)?,
            ProtocolData::Witness(_) => {}
        }
        Ok(())
    }

    /// Checks that need the channel the data was published on: derived
    /// ids are computed inside the organization namespace.
    pub fn validate_on(&self, channel: &Channel) -> ProtocolResult<()> {
        let lao_id = |required: bool| -> ProtocolResult<Option<EntityId>> {
            match channel.lao_id() {
                Some(id) => id.parse().map(Some),
                None if required => Err(malformed(format!("{channel} is not an organization channel"))),
                None => Ok(None),
            }
        };

        match self {
            ProtocolData::CreateLao(d) => {
                if lao_id(false)?.is_some_and(|id| id != d.id) {
                    return Err(malformed("lao#create published outside its own channel"));
                }
            }
            ProtocolData::CreateRollCall(d) => {
                let lao = lao_id(true)?.ok_or_else(|| malformed("missing lao id"))?;
                if ids::roll_call(&lao, d.creation, &d.name) != d.id {
                    return Err(malformed("roll call id does not match its fields"));
                }
            }
            ProtocolData::OpenRollCall(d) | ProtocolData::ReopenRollCall(d) => {
                let lao = lao_id(true)?.ok_or_else(|| malformed("missing lao id"))?;
                if ids::roll_call_update(&lao, &d.opens, d.opened_at) != d.update_id {
                    return Err(malformed("roll call update id does not match its fields"));
                }
            }
            ProtocolData::CloseRollCall(d) => {
                let lao = lao_id(true)?.ok_or_else(|| malformed("missing lao id"))?;
                if ids::roll_call_update(&lao, &d.closes, d.closed_at) != d.update_id {
                    return Err(malformed("roll call update id does not match its fields"));
                }
            }
            ProtocolData::CreateMeeting(d) => {
                let lao = lao_id(true)?.ok_or_else(|| malformed("missing lao id"))?;
                if ids::meeting(&lao, d.creation, &d.name) != d.id {
                    return Err(malformed("meeting id does not match its fields"));
                }
            }
            ProtocolData::SetupElection(d) => {
                let lao = lao_id(true)?.ok_or_else(|| malformed("missing lao id"))?;
                if d.lao != lao || ids::election(&lao, d.created_at, &d.name) != d.id {
                    return Err(malformed("election id does not match its fields"));
                }
            }
            ProtocolData::OpenElection(OpenElection { lao, .. })
            | ProtocolData::EndElection(EndElection { lao, .. }) => {
                if lao_id(true)? != Some(*lao) {
                    return Err(malformed("election message for another organization"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn take_tag(fields: &mut Map<String, Value>, key: &str) -> ProtocolResult<String> {
    match fields.remove(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(malformed(format!("field {key} is not a string"))),
        None => Err(malformed(format!("missing field {key}"))),
    }
}

fn non_empty(name: &str, value: &str) -> ProtocolResult<()> {
    if value.is_empty() {
        return Err(malformed(format!("{name} is empty")));
    }
    Ok(())
}

fn non_negative(name: &str, ts: Timestamp) -> ProtocolResult<()> {
    if ts < Timestamp::ZERO {
        return Err(malformed(format!("{name} is negative")));
    }
    Ok(())
}

fn not_before(name: &str, ts: Timestamp, bound: Timestamp) -> ProtocolResult<()> {
    if ts < bound {
        return Err(malformed(format!("{name} ({ts}) precedes {bound}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(b: u8) -> PublicKey {
        PublicKey::from_bytes([b; 32])
    }

    fn lao() -> CreateLao {
        CreateLao::new(key(1), "LAO", Timestamp(1_000), vec![key(2)])
    }

    fn decode_json(value: Value) -> ProtocolResult<ProtocolData> {
        ProtocolData::decode(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn test_create_lao_through_table() {
        let data = ProtocolData::CreateLao(lao());
        let bytes = data.encode().unwrap();

        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["object"], "lao");
        assert_eq!(raw["action"], "create");

        let decoded = ProtocolData::decode(&bytes).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(decoded.role(), DataRole::Create);
        assert_eq!(decoded.last_modified(), Some(Timestamp(1_000)));
    }

    #[test]
    fn test_unknown_pair_is_malformed() {
        let err = decode_json(json!({"object": "lao", "action": "explode"})).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedData(m) if m.contains("lao#explode")));

        let err = decode_json(json!({"object": "chirp", "action": "create"})).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedData(_)));
    }

    #[test]
    fn test_missing_tag_or_field() {
        assert!(matches!(
            decode_json(json!({"action": "create"})),
            Err(ProtocolError::MalformedData(_))
        ));

        let mut value = serde_json::from_slice::<Value>(&ProtocolData::CreateLao(lao()).encode().unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("organizer");
        assert!(matches!(decode_json(value), Err(ProtocolError::MalformedData(m)) if m.contains("organizer")));
    }

    #[test]
    fn test_not_an_object() {
        assert!(ProtocolData::decode(b"[1,2]").is_err());
        assert!(ProtocolData::decode(b"not json").is_err());
    }

    #[test]
    fn test_lao_id_must_match() {
        let mut data = lao();
        data.name = "Renamed".into();
        let bytes = serde_json::to_vec(&json!({
            "object": "lao", "action": "create",
            "id": data.id, "name": data.name, "creation": data.creation,
            "organizer": data.organizer, "witnesses": data.witnesses,
        }))
        .unwrap();

        assert!(matches!(
            ProtocolData::decode(&bytes),
            Err(ProtocolError::MalformedData(m)) if m.contains("lao id")
        ));
    }

    #[test]
    fn test_semantic_rules() {
        let lao = lao();
        let mut rc = CreateRollCall::new(&lao.id, "RC", Timestamp(10), Timestamp(20), Timestamp(30), "here");
        rc.proposed_end = Timestamp(15);
        let bytes = ProtocolData::CreateRollCall(rc).encode().unwrap();
        assert!(ProtocolData::decode(&bytes).is_err());

        let update = UpdateLao {
            id: lao.id,
            name: String::new(),
            last_modified: Timestamp(2_000),
            witnesses: vec![],
        };
        let bytes = ProtocolData::UpdateLao(update).encode().unwrap();
        assert!(ProtocolData::decode(&bytes).is_err());

        let update = UpdateLao {
            id: lao.id,
            name: "x".into(),
            last_modified: Timestamp(-1),
            witnesses: vec![],
        };
        let bytes = ProtocolData::UpdateLao(update).encode().unwrap();
        assert!(ProtocolData::decode(&bytes).is_err());
    }

    #[test]
    fn test_roll_call_ids_checked_on_channel() {
        let lao = lao();
        let channel = Channel::for_lao(lao.id.as_str()).unwrap();
        let other = Channel::for_lao(ids::lao(&key(9), Timestamp(5), "other").as_str()).unwrap();

        let rc = CreateRollCall::new(&lao.id, "RC", Timestamp(10), Timestamp(20), Timestamp(30), "here");
        let open = ProtocolData::OpenRollCall(OpenRollCall::new(&lao.id, rc.id, Timestamp(25)));
        let create = ProtocolData::CreateRollCall(rc);

        assert!(create.validate_on(&channel).is_ok());
        assert!(open.validate_on(&channel).is_ok());
        assert!(create.validate_on(&other).is_err());
        assert!(open.validate_on(&other).is_err());
        assert!(create.validate_on(&Channel::root()).is_err());
    }

    #[test]
    fn test_create_lao_channel() {
        let lao = lao();
        let data = ProtocolData::CreateLao(lao.clone());

        assert!(data.validate_on(&Channel::root()).is_ok());
        assert!(data.validate_on(&Channel::for_lao(lao.id.as_str()).unwrap()).is_ok());
        let elsewhere = Channel::for_lao(ids::lao(&key(3), Timestamp(1), "x").as_str()).unwrap();
        assert!(data.validate_on(&elsewhere).is_err());
    }

    #[test]
    fn test_targets_and_update_ids() {
        let lao = lao();
        let rc = CreateRollCall::new(&lao.id, "RC", Timestamp(10), Timestamp(20), Timestamp(30), "here");
        let close = CloseRollCall::new(&lao.id, rc.id, Timestamp(40), vec![key(7)]);

        let data = ProtocolData::CloseRollCall(close.clone());
        assert_eq!(data.target(), Some(rc.id));
        assert_eq!(data.update_id(), Some(close.update_id));
        assert_eq!(data.kind(), (ObjectKind::RollCall, ActionKind::Close));
        assert_eq!(data.role(), DataRole::Modify);
    }

    #[test]
    fn test_witness_data() {
        let target = MessageId::compute(b"data", b"sig");
        let data = ProtocolData::Witness(WitnessMessage {
            message_id: target,
            signature: Signature::from_bytes([4; 64]),
        });
        let decoded = ProtocolData::decode(&data.encode().unwrap()).unwrap();

        assert_eq!(decoded, data);
        assert_eq!(decoded.role(), DataRole::Witness);
        assert_eq!(decoded.target(), None);
        assert_eq!(decoded.last_modified(), None);
    }

    #[test]
    fn test_election_setup_on_channel() {
        let lao = lao();
        let channel = Channel::for_lao(lao.id.as_str()).unwrap();
        let setup = SetupElection::new(&lao.id, "Vote", Timestamp(50), Timestamp(60), Timestamp(70));
        let open = OpenElection {
            lao: lao.id,
            election: setup.id,
            opened_at: Timestamp(60),
        };

        let setup = ProtocolData::decode(&ProtocolData::SetupElection(setup).encode().unwrap()).unwrap();
        assert!(setup.validate_on(&channel).is_ok());
        assert!(ProtocolData::OpenElection(open).validate_on(&channel).is_ok());
    }
}
