//! Authoritative card-game state machine for a single room
//!
//! The engine is pure: it performs no I/O and holds no locks. All calls are
//! made under the room registry lock via `RoomRegistry::with_room`, which is
//! what serializes turns within a room.
//!
//! Rules in brief: each seat starts with three face-down reserve cards and a
//! three-card hand. A play must match or beat the top of the discard pile,
//! with three special ranks: TWO is wild (plays on anything, accepts
//! anything), SEVEN forces the next play to be value seven or lower, and TEN
//! burns the discard pile. Hands refill to three while the draw pile lasts.
//! A seat that empties both hand and reserves wins.

use log::info;
use rand::seq::SliceRandom;
use shared::{standard_deck, Card, Rank};

/// Cards dealt to each seat's hand and reserve row, and the refill target.
pub const HAND_SIZE: usize = 3;
pub const RESERVE_SIZE: usize = 3;

/// Lifecycle of a room's game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    Waiting,
    Playing,
    Finished,
}

/// Outcome of a play, reserve play, or pickup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayResult {
    /// The action was applied and the turn advanced.
    Success,
    /// The action was applied and ended the game; the actor won.
    GameOver,
    /// A blind reserve flip failed: the actor picked up the pile plus the
    /// revealed card, and the turn advanced. The reserve card is consumed.
    PickupRequired,
    /// The actor is not seated here or it is not their turn.
    InvalidPlayer,
    /// The request violates the card rules (bad set, not in hand, unplayable).
    InvalidCard,
}

/// One seat's cards.
#[derive(Debug, Clone)]
pub struct Seat {
    pub name: String,
    pub hand: Vec<Card>,
    pub reserves: Vec<Card>,
}

/// Game state owned 1:1 by a room.
#[derive(Debug, Clone)]
pub struct Game {
    deck: Vec<Card>,
    discard: Vec<Card>,
    seats: Vec<Seat>,
    current_seat: usize,
    /// Direction of play; always forward with two seats, kept for larger
    /// tables.
    forward: bool,
    must_play_low: bool,
    phase: GamePhase,
}

impl Game {
    pub fn new() -> Self {
        Game {
            deck: Vec::new(),
            discard: Vec::new(),
            seats: Vec::new(),
            current_seat: 0,
            forward: true,
            must_play_low: false,
            phase: GamePhase::Waiting,
        }
    }

    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    /// Adds a seat. Fails once the game has started or if the name is
    /// already seated.
    pub fn add_player(&mut self, name: &str) -> bool {
        if self.phase != GamePhase::Waiting || self.seat_index(name).is_some() {
            return false;
        }
        self.seats.push(Seat {
            name: name.to_string(),
            hand: Vec::new(),
            reserves: Vec::new(),
        });
        true
    }

    /// Removes a seat before the game starts.
    pub fn remove_player(&mut self, name: &str) -> bool {
        if self.phase != GamePhase::Waiting {
            return false;
        }
        match self.seat_index(name) {
            Some(index) => {
                self.seats.remove(index);
                true
            }
            None => false,
        }
    }

    /// Shuffles a fresh 52-card deck and deals each seat three reserves and
    /// a three-card hand, in seating order. The discard pile starts empty
    /// and seat 0 opens.
    pub fn start_game(&mut self) -> bool {
        if self.phase != GamePhase::Waiting || self.seats.len() < 2 {
            return false;
        }

        self.deck = standard_deck();
        self.deck.shuffle(&mut rand::thread_rng());
        self.discard.clear();

        for seat in &mut self.seats {
            seat.hand.clear();
            seat.reserves.clear();
            for _ in 0..RESERVE_SIZE {
                if let Some(card) = self.deck.pop() {
                    seat.reserves.push(card);
                }
            }
            for _ in 0..HAND_SIZE {
                if let Some(card) = self.deck.pop() {
                    seat.hand.push(card);
                }
            }
        }

        self.current_seat = 0;
        self.forward = true;
        self.must_play_low = false;
        self.phase = GamePhase::Playing;
        info!("Game started with {} seats", self.seats.len());
        true
    }

    // ------------------------------------------------------------------
    // Turn actions
    // ------------------------------------------------------------------

    /// Plays a set of same-rank cards from the actor's hand.
    pub fn play_cards(&mut self, name: &str, cards: &[Card]) -> PlayResult {
        if !self.is_player_turn(name) {
            return PlayResult::InvalidPlayer;
        }
        if cards.is_empty() {
            return PlayResult::InvalidCard;
        }

        // Multi-play sets must share one rank.
        let rank = cards[0].rank;
        if cards.iter().any(|c| c.rank != rank) {
            return PlayResult::InvalidCard;
        }

        // Membership: every requested card must come out of the hand,
        // respecting multiplicity.
        let seat_index = self.current_seat;
        let mut remaining = self.seats[seat_index].hand.clone();
        for card in cards {
            match remaining.iter().position(|c| c == card) {
                Some(pos) => {
                    remaining.remove(pos);
                }
                None => return PlayResult::InvalidCard,
            }
        }

        if !self.can_play(cards[0]) {
            return PlayResult::InvalidCard;
        }

        self.seats[seat_index].hand = remaining;
        self.discard.extend_from_slice(cards);
        self.apply_special_effects(rank);
        self.refill_hand(seat_index);

        if self.seat_is_empty(seat_index) {
            self.phase = GamePhase::Finished;
            info!("Player {} wins", name);
            return PlayResult::GameOver;
        }

        self.advance_turn();
        PlayResult::Success
    }

    /// Blind reserve play: flips the seat's first reserve card. Only legal
    /// with an empty hand and at least one reserve. The flipped card is
    /// consumed either way; an unplayable flip forces the actor to pick up
    /// the pile together with it.
    pub fn play_reserve(&mut self, name: &str) -> PlayResult {
        if !self.is_player_turn(name) {
            return PlayResult::InvalidPlayer;
        }
        let seat_index = self.current_seat;
        if !self.seats[seat_index].hand.is_empty() || self.seats[seat_index].reserves.is_empty() {
            return PlayResult::InvalidCard;
        }

        let card = self.seats[seat_index].reserves.remove(0);

        if self.can_play(card) {
            self.discard.push(card);
            self.apply_special_effects(card.rank);

            if self.seat_is_empty(seat_index) {
                self.phase = GamePhase::Finished;
                info!("Player {} wins from reserve", name);
                return PlayResult::GameOver;
            }
            self.advance_turn();
            PlayResult::Success
        } else {
            let seat = &mut self.seats[seat_index];
            seat.hand.push(card);
            seat.hand.append(&mut self.discard);
            self.must_play_low = false;
            self.advance_turn();
            PlayResult::PickupRequired
        }
    }

    /// Takes the whole discard pile into the actor's hand and passes the
    /// turn.
    pub fn pickup_pile(&mut self, name: &str) -> PlayResult {
        if !self.is_player_turn(name) {
            return PlayResult::InvalidPlayer;
        }
        if self.discard.is_empty() {
            return PlayResult::InvalidCard;
        }

        let seat_index = self.current_seat;
        self.seats[seat_index].hand.append(&mut self.discard);
        self.must_play_low = false;
        self.advance_turn();
        PlayResult::Success
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == GamePhase::Playing
    }

    pub fn seats(&self) -> &[Seat] {
        &self.seats
    }

    pub fn seat_count(&self) -> usize {
        self.seats.len()
    }

    pub fn is_player_turn(&self, name: &str) -> bool {
        self.phase == GamePhase::Playing
            && self
                .seats
                .get(self.current_seat)
                .is_some_and(|seat| seat.name == name)
    }

    pub fn current_player(&self) -> Option<&str> {
        if self.phase != GamePhase::Playing {
            return None;
        }
        self.seats
            .get(self.current_seat)
            .map(|seat| seat.name.as_str())
    }

    pub fn hand_of(&self, name: &str) -> Option<&[Card]> {
        self.seat_index(name)
            .map(|index| self.seats[index].hand.as_slice())
    }

    pub fn reserve_count_of(&self, name: &str) -> usize {
        self.seat_index(name)
            .map(|index| self.seats[index].reserves.len())
            .unwrap_or(0)
    }

    pub fn deck_size(&self) -> usize {
        self.deck.len()
    }

    pub fn discard_size(&self) -> usize {
        self.discard.len()
    }

    /// Top of the discard pile; callers substitute the `1S` marker on the
    /// wire when this is `None`.
    pub fn top_discard(&self) -> Option<Card> {
        self.discard.last().copied()
    }

    pub fn must_play_low(&self) -> bool {
        self.must_play_low
    }

    /// The winning seat once the game is finished.
    pub fn winner(&self) -> Option<&str> {
        if self.phase != GamePhase::Finished {
            return None;
        }
        self.seats
            .iter()
            .find(|seat| seat.hand.is_empty() && seat.reserves.is_empty())
            .map(|seat| seat.name.as_str())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn seat_index(&self, name: &str) -> Option<usize> {
        self.seats.iter().position(|seat| seat.name == name)
    }

    fn seat_is_empty(&self, index: usize) -> bool {
        self.seats[index].hand.is_empty() && self.seats[index].reserves.is_empty()
    }

    /// Whether `card` may be played on the current pile state.
    fn can_play(&self, card: Card) -> bool {
        // Wild always plays.
        if card.rank == Rank::Two {
            return true;
        }
        let Some(top) = self.top_discard() else {
            // Empty pile accepts anything.
            return true;
        };
        // A wild on top accepts anything.
        if top.rank == Rank::Two {
            return true;
        }
        // After a SEVEN the only legal plays are value seven or lower; this
        // gate also blocks the TEN.
        if self.must_play_low {
            return card.value() <= 7;
        }
        if card.rank == Rank::Ten {
            return true;
        }
        card.value() >= top.value()
    }

    /// Applies TEN burn and SEVEN low-constraint after cards were pushed to
    /// the pile. Any other play clears the constraint.
    fn apply_special_effects(&mut self, rank: Rank) {
        if rank == Rank::Ten {
            // The burn removes the pile including the tens just played.
            self.discard.clear();
        }
        self.must_play_low = rank == Rank::Seven;
    }

    fn refill_hand(&mut self, seat_index: usize) {
        let seat = &mut self.seats[seat_index];
        while seat.hand.len() < HAND_SIZE {
            match self.deck.pop() {
                Some(card) => seat.hand.push(card),
                // Deck exhausted: play continues without refill.
                None => break,
            }
        }
    }

    /// Test-only constructor with explicit seats and pile state, seat 0 to
    /// move.
    #[cfg(test)]
    pub(crate) fn rigged(
        seats: Vec<(String, Vec<Card>, Vec<Card>)>,
        deck: Vec<Card>,
        discard: Vec<Card>,
        must_play_low: bool,
    ) -> Game {
        Game {
            deck,
            discard,
            seats: seats
                .into_iter()
                .map(|(name, hand, reserves)| Seat {
                    name,
                    hand,
                    reserves,
                })
                .collect(),
            current_seat: 0,
            forward: true,
            must_play_low,
            phase: GamePhase::Playing,
        }
    }

    fn advance_turn(&mut self) {
        if self.seats.is_empty() {
            return;
        }
        if self.forward {
            self.current_seat = (self.current_seat + 1) % self.seats.len();
        } else {
            self.current_seat = match self.current_seat {
                0 => self.seats.len() - 1,
                index => index - 1,
            };
        }
    }
}

impl Default for Game {
    fn default() -> Self {
        Self::new()
    }
}
