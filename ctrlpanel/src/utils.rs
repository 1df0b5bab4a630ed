/// Fixed capacity table kept sorted by key.
pub mod slots;
/// Test fixture helpers.
pub mod tests;
