// tests/property/main.rs

mod backoff;
mod schedule;
