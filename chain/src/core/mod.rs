pub mod clock;
pub mod delegates;
pub mod forger;
pub mod gossip;
pub mod mempool;
pub mod processor;
pub mod slot_loop;
pub mod sync;
pub mod verify;
