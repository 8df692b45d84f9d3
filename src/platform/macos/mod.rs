// macOS-specific system notifications

pub mod wake;
