pub mod access;
pub mod attempt;
pub mod attempts;
pub mod collaborators;
pub mod layout;
pub mod navigation;
pub mod test_definition;
pub mod timing;
pub mod usage;
