//! API Routes
//!
//! Route handlers organized by functionality.

pub mod analysis;
pub mod health;
pub mod patterns;
