pub mod arena_deck;
pub mod clan;
pub mod grand_arena;
pub mod player_profile;
