//! # Shared Protocol Library
//!
//! Data types shared by the Palace game server and anything that speaks its
//! wire protocol (the integration tests drive the server through this crate
//! the same way a real client would).
//!
//! ## Wire format
//!
//! Every message is a single newline-terminated frame of pipe-separated
//! fields:
//!
//! ```text
//! TYPE|PLAYER|ROOM|key=value|key=value
//! ```
//!
//! `TYPE` is a decimal message-type code, `PLAYER` and `ROOM` are opaque
//! (possibly empty) strings, and the remaining fields are `key=value` data
//! entries. Values may contain `=` but never `|` or a newline. A frame is
//! well-formed when it contains at least one `|` and its type token parses
//! as an integer in `[0, 200]`.
//!
//! ## Card encoding
//!
//! Cards travel as `rank + suit letter`: `2H`..`10H`, `JH`, `QH`, `KH`,
//! `AH` and the same for `D`, `C`, `S`. The pseudo-card `1S` marks an empty
//! discard pile in outbound state messages and is not parseable as a real
//! card. The literal token `RESERVE` in a play request asks for a blind
//! reserve play.

use std::fmt;
use std::str::FromStr;

// ============================================================================
// Protocol constants
// ============================================================================

/// Highest message-type code accepted by the frame decoder.
pub const MAX_TYPE_CODE: u16 = 200;

/// Inbound per-connection buffer cap; exceeding it closes the connection.
pub const MAX_INBOUND_BUFFER: usize = 8 * 1024;

/// Player name length bounds.
pub const MIN_NAME_LEN: usize = 1;
pub const MAX_NAME_LEN: usize = 32;

/// Marker sent as `top_card` when the discard pile is empty.
pub const EMPTY_PILE_CODE: &str = "1S";

/// Literal `cards` value requesting a blind reserve play.
pub const RESERVE_TOKEN: &str = "RESERVE";

/// Data key attached to room-notification copies of broadcast frames.
pub const BROADCAST_TYPE_KEY: &str = "broadcast_type";
pub const ROOM_NOTIFICATION: &str = "room_notification";

/// Returns true if `name` is a legal player name: 1..=32 characters from
/// `[A-Za-z0-9_-]`.
pub fn is_valid_player_name(name: &str) -> bool {
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ============================================================================
// Message types
// ============================================================================

/// Protocol message types. Codes below 100 are client-to-server, codes from
/// 100 up are server-to-client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Client -> server
    Connect,
    JoinRoom,
    LeaveRoom,
    Ping,
    StartGame,
    Reconnect,
    PlayCards,
    PickupPile,

    // Server -> client
    Connected,
    RoomJoined,
    RoomLeft,
    Error,
    Pong,
    GameStarted,
    GameState,
    PlayerDisconnected,
    PlayerReconnected,
    TurnResult,
    GameOver,
}

impl MessageType {
    /// Numeric wire code for this message type.
    pub fn code(self) -> u16 {
        match self {
            MessageType::Connect => 0,
            MessageType::JoinRoom => 2,
            MessageType::LeaveRoom => 3,
            MessageType::Ping => 4,
            MessageType::StartGame => 5,
            MessageType::Reconnect => 6,
            MessageType::PlayCards => 7,
            MessageType::PickupPile => 8,
            MessageType::Connected => 100,
            MessageType::RoomJoined => 101,
            MessageType::RoomLeft => 102,
            MessageType::Error => 103,
            MessageType::Pong => 104,
            MessageType::GameStarted => 105,
            MessageType::GameState => 106,
            MessageType::PlayerDisconnected => 107,
            MessageType::PlayerReconnected => 109,
            MessageType::TurnResult => 111,
            MessageType::GameOver => 112,
        }
    }

    /// Maps a wire code back to a message type.
    pub fn from_code(code: u16) -> Option<MessageType> {
        Some(match code {
            0 => MessageType::Connect,
            2 => MessageType::JoinRoom,
            3 => MessageType::LeaveRoom,
            4 => MessageType::Ping,
            5 => MessageType::StartGame,
            6 => MessageType::Reconnect,
            7 => MessageType::PlayCards,
            8 => MessageType::PickupPile,
            100 => MessageType::Connected,
            101 => MessageType::RoomJoined,
            102 => MessageType::RoomLeft,
            103 => MessageType::Error,
            104 => MessageType::Pong,
            105 => MessageType::GameStarted,
            106 => MessageType::GameState,
            107 => MessageType::PlayerDisconnected,
            109 => MessageType::PlayerReconnected,
            111 => MessageType::TurnResult,
            112 => MessageType::GameOver,
            _ => return None,
        })
    }

    /// Data key an inbound message of this type must carry (with a
    /// non-empty value), if any.
    pub fn required_data_key(self) -> Option<&'static str> {
        match self {
            MessageType::Connect | MessageType::Reconnect => Some("name"),
            MessageType::PlayCards => Some("cards"),
            _ => None,
        }
    }

    /// Human-readable name used in log output.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Connect => "CONNECT",
            MessageType::JoinRoom => "JOIN_ROOM",
            MessageType::LeaveRoom => "LEAVE_ROOM",
            MessageType::Ping => "PING",
            MessageType::StartGame => "START_GAME",
            MessageType::Reconnect => "RECONNECT",
            MessageType::PlayCards => "PLAY_CARDS",
            MessageType::PickupPile => "PICKUP_PILE",
            MessageType::Connected => "CONNECTED",
            MessageType::RoomJoined => "ROOM_JOINED",
            MessageType::RoomLeft => "ROOM_LEFT",
            MessageType::Error => "ERROR",
            MessageType::Pong => "PONG",
            MessageType::GameStarted => "GAME_STARTED",
            MessageType::GameState => "GAME_STATE",
            MessageType::PlayerDisconnected => "PLAYER_DISCONNECTED",
            MessageType::PlayerReconnected => "PLAYER_RECONNECTED",
            MessageType::TurnResult => "TURN_RESULT",
            MessageType::GameOver => "GAME_OVER",
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Why an inbound line failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// No `|` separator, or the type token is not an integer in `[0, 200]`.
    BadFormat,
    /// The type token parsed but names no known message type.
    UnknownType(u16),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::BadFormat => write!(f, "malformed frame"),
            DecodeError::UnknownType(code) => write!(f, "unknown message type {}", code),
        }
    }
}

impl std::error::Error for DecodeError {}

/// One protocol frame.
///
/// Data entries keep their insertion order so that encoding is deterministic
/// and matches what the other side observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub player: String,
    pub room: String,
    data: Vec<(String, String)>,
}

impl Frame {
    pub fn new(msg_type: MessageType) -> Self {
        Frame {
            msg_type,
            player: String::new(),
            room: String::new(),
            data: Vec::new(),
        }
    }

    /// Appends or replaces a data entry. Replacing keeps the original
    /// position so encode order stays stable.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.data.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.data.push((key.to_string(), value));
        }
    }

    /// Builder-style variant of [`Frame::set`].
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.iter().any(|(k, _)| k == key)
    }

    pub fn data(&self) -> &[(String, String)] {
        &self.data
    }

    /// Serializes the frame as a newline-terminated line.
    pub fn encode(&self) -> String {
        let mut out = format!("{}|{}|{}", self.msg_type.code(), self.player, self.room);
        for (key, value) in &self.data {
            out.push('|');
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out.push('\n');
        out
    }

    /// Parses one frame from a line (trailing `\n` / `\r` tolerated).
    ///
    /// Malformed `key=value` segments (no `=`) are dropped silently; a
    /// missing pipe or a bad type token is a [`DecodeError::BadFormat`].
    pub fn decode(line: &str) -> Result<Frame, DecodeError> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');
        if !line.contains('|') {
            return Err(DecodeError::BadFormat);
        }

        let mut fields = line.split('|');
        let type_token = fields.next().unwrap_or("");
        let code: u16 = type_token.parse().map_err(|_| DecodeError::BadFormat)?;
        if code > MAX_TYPE_CODE {
            return Err(DecodeError::BadFormat);
        }
        let msg_type = MessageType::from_code(code).ok_or(DecodeError::UnknownType(code))?;

        let player = fields.next().unwrap_or("").to_string();
        let room = fields.next().unwrap_or("").to_string();

        let mut frame = Frame {
            msg_type,
            player,
            room,
            data: Vec::new(),
        };
        for segment in fields {
            // First '=' splits key from value; values may themselves
            // contain '='.
            if let Some(pos) = segment.find('=') {
                frame
                    .data
                    .push((segment[..pos].to_string(), segment[pos + 1..].to_string()));
            }
        }
        Ok(frame)
    }
}

// ============================================================================
// Cards
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Suit {
    Hearts,
    Diamonds,
    Clubs,
    Spades,
}

impl Suit {
    pub const ALL: [Suit; 4] = [Suit::Hearts, Suit::Diamonds, Suit::Clubs, Suit::Spades];

    pub fn letter(self) -> char {
        match self {
            Suit::Hearts => 'H',
            Suit::Diamonds => 'D',
            Suit::Clubs => 'C',
            Suit::Spades => 'S',
        }
    }

    pub fn from_letter(c: char) -> Option<Suit> {
        match c {
            'H' => Some(Suit::Hearts),
            'D' => Some(Suit::Diamonds),
            'C' => Some(Suit::Clubs),
            'S' => Some(Suit::Spades),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rank {
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Ten,
    Jack,
    Queen,
    King,
    Ace,
}

impl Rank {
    pub const ALL: [Rank; 13] = [
        Rank::Two,
        Rank::Three,
        Rank::Four,
        Rank::Five,
        Rank::Six,
        Rank::Seven,
        Rank::Eight,
        Rank::Nine,
        Rank::Ten,
        Rank::Jack,
        Rank::Queen,
        Rank::King,
        Rank::Ace,
    ];

    /// Ordinal value used for turn comparisons: 2..=10 for pip cards,
    /// J=11, Q=12, K=13, A=14.
    pub fn value(self) -> u8 {
        match self {
            Rank::Two => 2,
            Rank::Three => 3,
            Rank::Four => 4,
            Rank::Five => 5,
            Rank::Six => 6,
            Rank::Seven => 7,
            Rank::Eight => 8,
            Rank::Nine => 9,
            Rank::Ten => 10,
            Rank::Jack => 11,
            Rank::Queen => 12,
            Rank::King => 13,
            Rank::Ace => 14,
        }
    }

    fn token(self) -> &'static str {
        match self {
            Rank::Two => "2",
            Rank::Three => "3",
            Rank::Four => "4",
            Rank::Five => "5",
            Rank::Six => "6",
            Rank::Seven => "7",
            Rank::Eight => "8",
            Rank::Nine => "9",
            Rank::Ten => "10",
            Rank::Jack => "J",
            Rank::Queen => "Q",
            Rank::King => "K",
            Rank::Ace => "A",
        }
    }
}

/// A playing card as it appears on the wire, e.g. `10H` or `AS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Card {
    pub rank: Rank,
    pub suit: Suit,
}

impl Card {
    pub fn new(rank: Rank, suit: Suit) -> Self {
        Card { rank, suit }
    }

    pub fn value(self) -> u8 {
        self.rank.value()
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.rank.token(), self.suit.letter())
    }
}

/// Card token that failed strict parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardParseError(pub String);

impl fmt::Display for CardParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid card token: {:?}", self.0)
    }
}

impl std::error::Error for CardParseError {}

impl FromStr for Card {
    type Err = CardParseError;

    /// Strict parse: `A|J|Q|K|2..9` plus a suit letter, or `10` plus a suit
    /// letter. Anything else (including the `1S` empty-pile marker) is an
    /// error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || CardParseError(s.to_string());

        // Byte-indexed slicing below requires ASCII input.
        if !s.is_ascii() {
            return Err(err());
        }

        let (rank_token, suit_token) = match s.len() {
            2 => (&s[..1], &s[1..]),
            3 => (&s[..2], &s[2..]),
            _ => return Err(err()),
        };

        let rank = match rank_token {
            "2" => Rank::Two,
            "3" => Rank::Three,
            "4" => Rank::Four,
            "5" => Rank::Five,
            "6" => Rank::Six,
            "7" => Rank::Seven,
            "8" => Rank::Eight,
            "9" => Rank::Nine,
            "10" => Rank::Ten,
            "J" => Rank::Jack,
            "Q" => Rank::Queen,
            "K" => Rank::King,
            "A" => Rank::Ace,
            _ => return Err(err()),
        };

        let suit_char = suit_token.chars().next().ok_or_else(err)?;
        let suit = Suit::from_letter(suit_char).ok_or_else(err)?;

        Ok(Card { rank, suit })
    }
}

/// Parses a comma-separated card list; any bad token fails the whole list.
pub fn parse_card_list(s: &str) -> Result<Vec<Card>, CardParseError> {
    s.split(',').map(|token| token.parse()).collect()
}

/// Formats cards as the comma-separated list used in `hand` / `cards`
/// fields.
pub fn format_card_list(cards: &[Card]) -> String {
    let mut out = String::new();
    for (i, card) in cards.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&card.to_string());
    }
    out
}

/// Builds the standard 52-card deck in suit-major order.
pub fn standard_deck() -> Vec<Card> {
    let mut deck = Vec::with_capacity(52);
    for suit in Suit::ALL {
        for rank in Rank::ALL {
            deck.push(Card { rank, suit });
        }
    }
    deck
}

// ============================================================================
// Tests
// ============================================================================
