//! Upstream provider integrations.

pub mod services {
    pub use crate::services::*;
}

pub mod session_manager {
    pub use crate::session_manager::*;
}

pub mod token_manager {
    pub use crate::token_manager::*;
}

pub mod parsers {
    pub use crate::parsers::*;
}
