pub mod auto;
pub mod config;
pub mod controller;
pub mod events;
pub mod gate;
pub mod trainers;
pub mod training_loop;
