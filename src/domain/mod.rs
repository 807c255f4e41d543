pub mod box_dates;
pub mod calendar;
pub mod drag;
pub mod error;
pub mod models;
pub mod overlap;
