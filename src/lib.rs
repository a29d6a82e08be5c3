pub mod config;
pub mod framing;
pub mod hexdump;
pub mod ldap_protocol;
pub mod metrics;
pub mod pump;
pub mod rectifier;
pub mod rules;
pub mod server;
pub mod session;

pub use config::Config;
pub use framing::{Frame, FrameError, FrameReader};
pub use metrics::{Metrics, run_metrics_server};
pub use pump::{Direction, Pump};
pub use rectifier::Rectifier;
pub use rules::{RectificationRule, RuleTable};
pub use server::LdapProxy;
pub use session::{Session, SessionConfig};
