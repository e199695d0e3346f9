/// Admission control
///
/// Pre-flight budget checks and reservations:
/// - `AdmissionController` runs the tenant → member → reserve pipeline
/// - `ReservationBook` tracks open and closed reservations until they age out

pub mod book;
pub mod controller;
pub mod types;

pub use book::{CloseOutcome, ReservationBook};
pub use controller::AdmissionController;
pub use types::{
    AdmissionCheck, AdmissionDenied, AdmissionRequest, BudgetSnapshot, DenialReason,
    ReconcileOutcome, Reservation, TokenUsage,
};
