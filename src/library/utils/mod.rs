pub mod nano_clock;
