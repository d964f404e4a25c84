//! Read-only lookup tables the parser consults for display purposes only:
//! `/etc/protocols` and `/etc/services`. Pure parsing, cached behind a
//! process-scope `OnceLock` per source file path.

pub mod protocols;
pub mod services;
