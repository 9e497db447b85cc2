use crate::{ByteReader, ByteWriter, CodecError};
use half::f16;

/// Outcome of a client-initiated operation as reported on the wire: one
/// success byte, then either the payload or a human-readable reason.
pub type WireResult<T> = Result<T, String>;

fn encode_result<T>(
    writer: &mut ByteWriter,
    result: &WireResult<T>,
    encode: impl FnOnce(&mut ByteWriter, &T),
) {
    match result {
        Ok(value) => {
            writer.bool(true);
            encode(writer, value);
        }
        Err(reason) => {
            writer.bool(false);
            writer.string(reason);
        }
    }
}

fn decode_result<T>(
    reader: &mut ByteReader<'_>,
    decode: impl FnOnce(&mut ByteReader<'_>) -> Result<T, CodecError>,
) -> Result<WireResult<T>, CodecError> {
    if reader.bool()? {
        Ok(Ok(decode(reader)?))
    } else {
        Ok(Err(reader.string()?))
    }
}

fn encode_option_i32(writer: &mut ByteWriter, value: &Option<i32>) {
    match value {
        Some(inner) => {
            writer.bool(true);
            writer.i32(*inner);
        }
        None => writer.bool(false),
    }
}

fn decode_option_i32(reader: &mut ByteReader<'_>) -> Result<Option<i32>, CodecError> {
    if reader.bool()? {
        Ok(Some(reader.i32()?))
    } else {
        Ok(None)
    }
}

/// Room lifecycle phase as a single wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    SelectChart,
    WaitingForReady,
    Playing,
}

impl RoomState {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::SelectChart => 0,
            Self::WaitingForReady => 1,
            Self::Playing => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(Self::SelectChart),
            1 => Ok(Self::WaitingForReady),
            2 => Ok(Self::Playing),
            other => Err(CodecError::InvalidState(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub id: i32,
    pub name: String,
    pub monitor: bool,
}

impl UserInfo {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.i32(self.id);
        writer.string(&self.name);
        writer.bool(self.monitor);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            id: reader.i32()?,
            name: reader.string()?,
            monitor: reader.bool()?,
        })
    }
}

/// Room snapshot delivered inside a successful re-authentication so a
/// reconnecting client can restore its in-room UI.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRoomState {
    pub id: String,
    pub state: RoomState,
    pub live: bool,
    pub locked: bool,
    pub cycle: bool,
    pub is_host: bool,
    pub is_ready: bool,
    pub users: Vec<(i32, UserInfo)>,
    pub chart: Option<i32>,
}

impl ClientRoomState {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.string(&self.id);
        writer.u8(self.state.to_byte());
        writer.bool(self.live);
        writer.bool(self.locked);
        writer.bool(self.cycle);
        writer.bool(self.is_host);
        writer.bool(self.is_ready);
        writer.uleb(self.users.len() as u64);
        for (id, user) in &self.users {
            writer.i32(*id);
            user.encode(writer);
        }
        encode_option_i32(writer, &self.chart);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let id = reader.string()?;
        let state = RoomState::from_byte(reader.u8()?)?;
        let live = reader.bool()?;
        let locked = reader.bool()?;
        let cycle = reader.bool()?;
        let is_host = reader.bool()?;
        let is_ready = reader.bool()?;
        let count = reader.uleb()? as usize;
        let mut users = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let user_id = reader.i32()?;
            users.push((user_id, UserInfo::decode(reader)?));
        }
        let chart = decode_option_i32(reader)?;
        Ok(Self {
            id,
            state,
            live,
            locked,
            cycle,
            is_host,
            is_ready,
            users,
            chart,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinRoomResponse {
    pub state: RoomState,
    pub users: Vec<UserInfo>,
    pub live: bool,
}

impl JoinRoomResponse {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.u8(self.state.to_byte());
        writer.uleb(self.users.len() as u64);
        for user in &self.users {
            user.encode(writer);
        }
        writer.bool(self.live);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let state = RoomState::from_byte(reader.u8()?)?;
        let count = reader.uleb()? as usize;
        let mut users = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            users.push(UserInfo::decode(reader)?);
        }
        Ok(Self {
            state,
            users,
            live: reader.bool()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchPoint {
    pub pointer: i8,
    pub x: f16,
    pub y: f16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TouchFrame {
    pub time: f32,
    pub points: Vec<TouchPoint>,
}

fn encode_touches(writer: &mut ByteWriter, frames: &[TouchFrame]) {
    writer.uleb(frames.len() as u64);
    for frame in frames {
        writer.f32(frame.time);
        writer.uleb(frame.points.len() as u64);
        for point in &frame.points {
            writer.i8(point.pointer);
            writer.f16(point.x);
            writer.f16(point.y);
        }
    }
}

fn decode_touches(reader: &mut ByteReader<'_>) -> Result<Vec<TouchFrame>, CodecError> {
    let frame_count = reader.uleb()? as usize;
    let mut frames = Vec::with_capacity(frame_count.min(1024));
    for _ in 0..frame_count {
        let time = reader.f32()?;
        let point_count = reader.uleb()? as usize;
        let mut points = Vec::with_capacity(point_count.min(1024));
        for _ in 0..point_count {
            points.push(TouchPoint {
                pointer: reader.i8()?,
                x: reader.f16()?,
                y: reader.f16()?,
            });
        }
        frames.push(TouchFrame { time, points });
    }
    Ok(frames)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Judgement {
    pub time: f32,
    pub line_id: u32,
    pub note_id: u32,
    pub judgement: u8,
}

fn encode_judgements(writer: &mut ByteWriter, judgements: &[Judgement]) {
    writer.uleb(judgements.len() as u64);
    for judgement in judgements {
        writer.f32(judgement.time);
        writer.u32(judgement.line_id);
        writer.u32(judgement.note_id);
        writer.u8(judgement.judgement);
    }
}

fn decode_judgements(reader: &mut ByteReader<'_>) -> Result<Vec<Judgement>, CodecError> {
    let count = reader.uleb()? as usize;
    let mut judgements = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        judgements.push(Judgement {
            time: reader.f32()?,
            line_id: reader.u32()?,
            note_id: reader.u32()?,
            judgement: reader.u8()?,
        });
    }
    Ok(judgements)
}

/// Commands sent by the client, identified by a single leading tag byte.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Ping,
    Authenticate { token: String },
    Chat { message: String },
    Touches { frames: Vec<TouchFrame> },
    Judges { judgements: Vec<Judgement> },
    CreateRoom { id: String },
    JoinRoom { id: String, monitor: bool },
    LeaveRoom,
    LockRoom { lock: bool },
    CycleRoom { cycle: bool },
    SelectChart { id: i32 },
    RequestStart,
    Ready,
    CancelReady,
    Played { id: i32 },
    Abort,
}

impl ClientCommand {
    pub fn encode(&self, writer: &mut ByteWriter) {
        match self {
            Self::Ping => writer.u8(0),
            Self::Authenticate { token } => {
                writer.u8(1);
                writer.string(token);
            }
            Self::Chat { message } => {
                writer.u8(2);
                writer.string(message);
            }
            Self::Touches { frames } => {
                writer.u8(3);
                encode_touches(writer, frames);
            }
            Self::Judges { judgements } => {
                writer.u8(4);
                encode_judgements(writer, judgements);
            }
            Self::CreateRoom { id } => {
                writer.u8(5);
                writer.string(id);
            }
            Self::JoinRoom { id, monitor } => {
                writer.u8(6);
                writer.string(id);
                writer.bool(*monitor);
            }
            Self::LeaveRoom => writer.u8(7),
            Self::LockRoom { lock } => {
                writer.u8(8);
                writer.bool(*lock);
            }
            Self::CycleRoom { cycle } => {
                writer.u8(9);
                writer.bool(*cycle);
            }
            Self::SelectChart { id } => {
                writer.u8(10);
                writer.i32(*id);
            }
            Self::RequestStart => writer.u8(11),
            Self::Ready => writer.u8(12),
            Self::CancelReady => writer.u8(13),
            Self::Played { id } => {
                writer.u8(14);
                writer.i32(*id);
            }
            Self::Abort => writer.u8(15),
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.encode(&mut writer);
        writer.into_inner()
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let tag = reader.u8()?;
        let command = match tag {
            0 => Self::Ping,
            1 => Self::Authenticate {
                token: reader.string()?,
            },
            2 => Self::Chat {
                message: reader.string()?,
            },
            3 => Self::Touches {
                frames: decode_touches(reader)?,
            },
            4 => Self::Judges {
                judgements: decode_judgements(reader)?,
            },
            5 => Self::CreateRoom {
                id: reader.string()?,
            },
            6 => Self::JoinRoom {
                id: reader.string()?,
                monitor: reader.bool()?,
            },
            7 => Self::LeaveRoom,
            8 => Self::LockRoom {
                lock: reader.bool()?,
            },
            9 => Self::CycleRoom {
                cycle: reader.bool()?,
            },
            10 => Self::SelectChart { id: reader.i32()? },
            11 => Self::RequestStart,
            12 => Self::Ready,
            13 => Self::CancelReady,
            14 => Self::Played { id: reader.i32()? },
            15 => Self::Abort,
            other => return Err(CodecError::InvalidTag(other)),
        };
        Ok(command)
    }

    /// Decodes one command from a whole frame payload, requiring the payload
    /// to be exactly one command.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(payload);
        let command = Self::decode(&mut reader)?;
        reader.finish()?;
        Ok(command)
    }
}

/// Events broadcast to every member of a room, nested inside
/// [`ServerCommand::Message`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Chat {
        user: i32,
        content: String,
    },
    CreateRoom {
        user: i32,
    },
    JoinRoom {
        user: i32,
        name: String,
    },
    LeaveRoom {
        user: i32,
        name: String,
    },
    NewHost {
        user: i32,
    },
    SelectChart {
        user: i32,
        name: String,
        id: i32,
    },
    GameStart {
        user: i32,
    },
    Ready {
        user: i32,
    },
    CancelReady {
        user: i32,
    },
    CancelGame {
        user: i32,
    },
    StartPlaying,
    Played {
        user: i32,
        score: i32,
        accuracy: f32,
        full_combo: bool,
    },
    GameEnd,
    Abort {
        user: i32,
    },
    LockRoom {
        lock: bool,
    },
    CycleRoom {
        cycle: bool,
    },
}

impl Message {
    fn encode(&self, writer: &mut ByteWriter) {
        match self {
            Self::Chat { user, content } => {
                writer.u8(0);
                writer.i32(*user);
                writer.string(content);
            }
            Self::CreateRoom { user } => {
                writer.u8(1);
                writer.i32(*user);
            }
            Self::JoinRoom { user, name } => {
                writer.u8(2);
                writer.i32(*user);
                writer.string(name);
            }
            Self::LeaveRoom { user, name } => {
                writer.u8(3);
                writer.i32(*user);
                writer.string(name);
            }
            Self::NewHost { user } => {
                writer.u8(4);
                writer.i32(*user);
            }
            Self::SelectChart { user, name, id } => {
                writer.u8(5);
                writer.i32(*user);
                writer.string(name);
                writer.i32(*id);
            }
            Self::GameStart { user } => {
                writer.u8(6);
                writer.i32(*user);
            }
            Self::Ready { user } => {
                writer.u8(7);
                writer.i32(*user);
            }
            Self::CancelReady { user } => {
                writer.u8(8);
                writer.i32(*user);
            }
            Self::CancelGame { user } => {
                writer.u8(9);
                writer.i32(*user);
            }
            Self::StartPlaying => writer.u8(10),
            Self::Played {
                user,
                score,
                accuracy,
                full_combo,
            } => {
                writer.u8(11);
                writer.i32(*user);
                writer.i32(*score);
                writer.f32(*accuracy);
                writer.bool(*full_combo);
            }
            Self::GameEnd => writer.u8(12),
            Self::Abort { user } => {
                writer.u8(13);
                writer.i32(*user);
            }
            Self::LockRoom { lock } => {
                writer.u8(14);
                writer.bool(*lock);
            }
            Self::CycleRoom { cycle } => {
                writer.u8(15);
                writer.bool(*cycle);
            }
        }
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let tag = reader.u8()?;
        let message = match tag {
            0 => Self::Chat {
                user: reader.i32()?,
                content: reader.string()?,
            },
            1 => Self::CreateRoom {
                user: reader.i32()?,
            },
            2 => Self::JoinRoom {
                user: reader.i32()?,
                name: reader.string()?,
            },
            3 => Self::LeaveRoom {
                user: reader.i32()?,
                name: reader.string()?,
            },
            4 => Self::NewHost {
                user: reader.i32()?,
            },
            5 => Self::SelectChart {
                user: reader.i32()?,
                name: reader.string()?,
                id: reader.i32()?,
            },
            6 => Self::GameStart {
                user: reader.i32()?,
            },
            7 => Self::Ready {
                user: reader.i32()?,
            },
            8 => Self::CancelReady {
                user: reader.i32()?,
            },
            9 => Self::CancelGame {
                user: reader.i32()?,
            },
            10 => Self::StartPlaying,
            11 => Self::Played {
                user: reader.i32()?,
                score: reader.i32()?,
                accuracy: reader.f32()?,
                full_combo: reader.bool()?,
            },
            12 => Self::GameEnd,
            13 => Self::Abort {
                user: reader.i32()?,
            },
            14 => Self::LockRoom {
                lock: reader.bool()?,
            },
            15 => Self::CycleRoom {
                cycle: reader.bool()?,
            },
            other => return Err(CodecError::InvalidTag(other)),
        };
        Ok(message)
    }
}

/// Commands sent by the server, in their own tag space.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    Pong,
    Authenticate(WireResult<(UserInfo, Option<ClientRoomState>)>),
    Chat(WireResult<()>),
    Touches {
        player: i32,
        frames: Vec<TouchFrame>,
    },
    Judges {
        player: i32,
        judgements: Vec<Judgement>,
    },
    Message(Message),
    ChangeState {
        state: RoomState,
        chart: Option<i32>,
    },
    ChangeHost(bool),
    CreateRoom(WireResult<()>),
    JoinRoom(WireResult<JoinRoomResponse>),
    OnJoinRoom(UserInfo),
    LeaveRoom(WireResult<()>),
    LockRoom(WireResult<()>),
    CycleRoom(WireResult<()>),
    SelectChart(WireResult<()>),
    RequestStart(WireResult<()>),
    Ready(WireResult<()>),
    CancelReady(WireResult<()>),
    Played(WireResult<()>),
    Abort(WireResult<()>),
}

fn encode_unit_result(writer: &mut ByteWriter, result: &WireResult<()>) {
    encode_result(writer, result, |_, ()| {});
}

fn decode_unit_result(reader: &mut ByteReader<'_>) -> Result<WireResult<()>, CodecError> {
    decode_result(reader, |_| Ok(()))
}

impl ServerCommand {
    pub fn encode(&self, writer: &mut ByteWriter) {
        match self {
            Self::Pong => writer.u8(0),
            Self::Authenticate(result) => {
                writer.u8(1);
                encode_result(writer, result, |writer, (user, room)| {
                    user.encode(writer);
                    match room {
                        Some(room) => {
                            writer.bool(true);
                            room.encode(writer);
                        }
                        None => writer.bool(false),
                    }
                });
            }
            Self::Chat(result) => {
                writer.u8(2);
                encode_unit_result(writer, result);
            }
            Self::Touches { player, frames } => {
                writer.u8(3);
                writer.i32(*player);
                encode_touches(writer, frames);
            }
            Self::Judges {
                player,
                judgements,
            } => {
                writer.u8(4);
                writer.i32(*player);
                encode_judgements(writer, judgements);
            }
            Self::Message(message) => {
                writer.u8(5);
                message.encode(writer);
            }
            Self::ChangeState { state, chart } => {
                writer.u8(6);
                writer.u8(state.to_byte());
                if *state == RoomState::SelectChart {
                    encode_option_i32(writer, chart);
                }
            }
            Self::ChangeHost(host) => {
                writer.u8(7);
                writer.bool(*host);
            }
            Self::CreateRoom(result) => {
                writer.u8(8);
                encode_unit_result(writer, result);
            }
            Self::JoinRoom(result) => {
                writer.u8(9);
                encode_result(writer, result, |writer, response| response.encode(writer));
            }
            Self::OnJoinRoom(user) => {
                writer.u8(10);
                user.encode(writer);
            }
            Self::LeaveRoom(result) => {
                writer.u8(11);
                encode_unit_result(writer, result);
            }
            Self::LockRoom(result) => {
                writer.u8(12);
                encode_unit_result(writer, result);
            }
            Self::CycleRoom(result) => {
                writer.u8(13);
                encode_unit_result(writer, result);
            }
            Self::SelectChart(result) => {
                writer.u8(14);
                encode_unit_result(writer, result);
            }
            Self::RequestStart(result) => {
                writer.u8(15);
                encode_unit_result(writer, result);
            }
            Self::Ready(result) => {
                writer.u8(16);
                encode_unit_result(writer, result);
            }
            Self::CancelReady(result) => {
                writer.u8(17);
                encode_unit_result(writer, result);
            }
            Self::Played(result) => {
                writer.u8(18);
                encode_unit_result(writer, result);
            }
            Self::Abort(result) => {
                writer.u8(19);
                encode_unit_result(writer, result);
            }
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.encode(&mut writer);
        writer.into_inner()
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let tag = reader.u8()?;
        let command = match tag {
            0 => Self::Pong,
            1 => Self::Authenticate(decode_result(reader, |reader| {
                let user = UserInfo::decode(reader)?;
                let room = if reader.bool()? {
                    Some(ClientRoomState::decode(reader)?)
                } else {
                    None
                };
                Ok((user, room))
            })?),
            2 => Self::Chat(decode_unit_result(reader)?),
            3 => Self::Touches {
                player: reader.i32()?,
                frames: decode_touches(reader)?,
            },
            4 => Self::Judges {
                player: reader.i32()?,
                judgements: decode_judgements(reader)?,
            },
            5 => Self::Message(Message::decode(reader)?),
            6 => {
                let state = RoomState::from_byte(reader.u8()?)?;
                let chart = if state == RoomState::SelectChart {
                    decode_option_i32(reader)?
                } else {
                    None
                };
                Self::ChangeState { state, chart }
            }
            7 => Self::ChangeHost(reader.bool()?),
            8 => Self::CreateRoom(decode_unit_result(reader)?),
            9 => Self::JoinRoom(decode_result(reader, JoinRoomResponse::decode)?),
            10 => Self::OnJoinRoom(UserInfo::decode(reader)?),
            11 => Self::LeaveRoom(decode_unit_result(reader)?),
            12 => Self::LockRoom(decode_unit_result(reader)?),
            13 => Self::CycleRoom(decode_unit_result(reader)?),
            14 => Self::SelectChart(decode_unit_result(reader)?),
            15 => Self::RequestStart(decode_unit_result(reader)?),
            16 => Self::Ready(decode_unit_result(reader)?),
            17 => Self::CancelReady(decode_unit_result(reader)?),
            18 => Self::Played(decode_unit_result(reader)?),
            19 => Self::Abort(decode_unit_result(reader)?),
            other => return Err(CodecError::InvalidTag(other)),
        };
        Ok(command)
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(payload);
        let command = Self::decode(&mut reader)?;
        reader.finish()?;
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_client(command: ClientCommand) {
        let encoded = command.encode_to_vec();
        let decoded = ClientCommand::decode_payload(&encoded).unwrap();
        assert_eq!(decoded, command);
    }

    fn roundtrip_server(command: ServerCommand) {
        let encoded = command.encode_to_vec();
        let decoded = ServerCommand::decode_payload(&encoded).unwrap();
        assert_eq!(decoded, command);
    }

    fn sample_user(id: i32) -> UserInfo {
        UserInfo {
            id,
            name: format!("player-{id}"),
            monitor: id % 2 == 0,
        }
    }

    fn sample_touches() -> Vec<TouchFrame> {
        vec![
            TouchFrame {
                time: 1.25,
                points: vec![
                    TouchPoint {
                        pointer: 0,
                        x: f16::from_f32(0.5),
                        y: f16::from_f32(-0.25),
                    },
                    TouchPoint {
                        pointer: 3,
                        x: f16::from_f32(1.0),
                        y: f16::from_f32(0.0),
                    },
                ],
            },
            TouchFrame {
                time: 1.5,
                points: Vec::new(),
            },
        ]
    }

    fn sample_judgements() -> Vec<Judgement> {
        vec![
            Judgement {
                time: 0.25,
                line_id: 2,
                note_id: 17,
                judgement: 0,
            },
            Judgement {
                time: 3.0,
                line_id: 0,
                note_id: 401,
                judgement: 3,
            },
        ]
    }

    #[test]
    fn client_commands_roundtrip() {
        let commands = vec![
            ClientCommand::Ping,
            ClientCommand::Authenticate {
                token: "bearer-token".into(),
            },
            ClientCommand::Chat {
                message: "你好".into(),
            },
            ClientCommand::Touches {
                frames: sample_touches(),
            },
            ClientCommand::Judges {
                judgements: sample_judgements(),
            },
            ClientCommand::CreateRoom { id: "0".into() },
            ClientCommand::JoinRoom {
                id: "652398".into(),
                monitor: true,
            },
            ClientCommand::LeaveRoom,
            ClientCommand::LockRoom { lock: true },
            ClientCommand::CycleRoom { cycle: false },
            ClientCommand::SelectChart { id: 100 },
            ClientCommand::RequestStart,
            ClientCommand::Ready,
            ClientCommand::CancelReady,
            ClientCommand::Played { id: 7 },
            ClientCommand::Abort,
        ];
        for command in commands {
            roundtrip_client(command);
        }
    }

    #[test]
    fn server_commands_roundtrip() {
        let room = ClientRoomState {
            id: "424242".into(),
            state: RoomState::WaitingForReady,
            live: true,
            locked: false,
            cycle: true,
            is_host: false,
            is_ready: true,
            users: vec![(1, sample_user(1)), (2, sample_user(2))],
            chart: Some(55),
        };
        let commands = vec![
            ServerCommand::Pong,
            ServerCommand::Authenticate(Ok((sample_user(42), Some(room)))),
            ServerCommand::Authenticate(Ok((sample_user(42), None))),
            ServerCommand::Authenticate(Err("invalid token".into())),
            ServerCommand::Chat(Ok(())),
            ServerCommand::Chat(Err("not in a room".into())),
            ServerCommand::Touches {
                player: 42,
                frames: sample_touches(),
            },
            ServerCommand::Judges {
                player: 42,
                judgements: sample_judgements(),
            },
            ServerCommand::Message(Message::Chat {
                user: 0,
                content: "welcome".into(),
            }),
            ServerCommand::ChangeState {
                state: RoomState::SelectChart,
                chart: Some(100),
            },
            ServerCommand::ChangeState {
                state: RoomState::SelectChart,
                chart: None,
            },
            ServerCommand::ChangeState {
                state: RoomState::Playing,
                chart: None,
            },
            ServerCommand::ChangeHost(true),
            ServerCommand::CreateRoom(Ok(())),
            ServerCommand::JoinRoom(Ok(JoinRoomResponse {
                state: RoomState::SelectChart,
                users: vec![sample_user(1), sample_user(2)],
                live: false,
            })),
            ServerCommand::JoinRoom(Err("room is full".into())),
            ServerCommand::OnJoinRoom(sample_user(9)),
            ServerCommand::LeaveRoom(Ok(())),
            ServerCommand::LockRoom(Ok(())),
            ServerCommand::CycleRoom(Ok(())),
            ServerCommand::SelectChart(Err("only the host can do this".into())),
            ServerCommand::RequestStart(Ok(())),
            ServerCommand::Ready(Ok(())),
            ServerCommand::CancelReady(Ok(())),
            ServerCommand::Played(Ok(())),
            ServerCommand::Abort(Ok(())),
        ];
        for command in commands {
            roundtrip_server(command);
        }
    }

    #[test]
    fn messages_roundtrip() {
        let messages = vec![
            Message::Chat {
                user: 5,
                content: "gg".into(),
            },
            Message::CreateRoom { user: 5 },
            Message::JoinRoom {
                user: 6,
                name: "B".into(),
            },
            Message::LeaveRoom {
                user: 6,
                name: "B".into(),
            },
            Message::NewHost { user: 7 },
            Message::SelectChart {
                user: 5,
                name: "Spasmodic".into(),
                id: 100,
            },
            Message::GameStart { user: 5 },
            Message::Ready { user: 6 },
            Message::CancelReady { user: 6 },
            Message::CancelGame { user: 5 },
            Message::StartPlaying,
            Message::Played {
                user: 6,
                score: 912_345,
                accuracy: 0.987,
                full_combo: false,
            },
            Message::GameEnd,
            Message::Abort { user: 6 },
            Message::LockRoom { lock: true },
            Message::CycleRoom { cycle: true },
        ];
        for message in messages {
            roundtrip_server(ServerCommand::Message(message));
        }
    }

    #[test]
    fn unknown_tags_are_fatal() {
        assert_eq!(
            ClientCommand::decode_payload(&[16]),
            Err(CodecError::InvalidTag(16))
        );
        assert_eq!(
            ServerCommand::decode_payload(&[20]),
            Err(CodecError::InvalidTag(20))
        );
        // Message tag space ends at 15.
        assert_eq!(
            ServerCommand::decode_payload(&[5, 16]),
            Err(CodecError::InvalidTag(16))
        );
    }

    #[test]
    fn truncated_payload_is_eof() {
        let encoded = ClientCommand::Authenticate {
            token: "token".into(),
        }
        .encode_to_vec();
        assert_eq!(
            ClientCommand::decode_payload(&encoded[..encoded.len() - 1]),
            Err(CodecError::UnexpectedEof)
        );
    }

    #[test]
    fn trailing_bytes_are_fatal() {
        let mut encoded = ClientCommand::Ping.encode_to_vec();
        encoded.push(0);
        assert_eq!(
            ClientCommand::decode_payload(&encoded),
            Err(CodecError::TrailingBytes)
        );
    }

    #[test]
    fn change_state_carries_chart_only_when_selecting() {
        let encoded = ServerCommand::ChangeState {
            state: RoomState::Playing,
            chart: None,
        }
        .encode_to_vec();
        // tag + state byte, nothing else
        assert_eq!(encoded, vec![6, 2]);

        let encoded = ServerCommand::ChangeState {
            state: RoomState::SelectChart,
            chart: Some(100),
        }
        .encode_to_vec();
        assert_eq!(encoded[..3], [6, 0, 1]);
        assert_eq!(encoded.len(), 7);
    }
}
