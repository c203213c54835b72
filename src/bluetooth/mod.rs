pub mod scanner;

pub use scanner::{BlueZPermission, BlueZScanner};
