//! Rectification engine: rule-driven byte-pattern substitution on operation body records.
//!
//! Rules run in table order against the current buffer, so a rule sees the replacement written
//! by an earlier one. A match replaces the whole record with the rule's replacement.

use crate::framing::{Frame, FrameError};
use crate::ldap_protocol::{record_name, validate_single_record};
use crate::rules::RuleTable;
use bytes::Bytes;
use tracing::debug;

/// Outcome of running the rule table over one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rectification<'a> {
    pub body: &'a [u8],
    pub rectified: bool,
    pub reply_to_sender: bool,
    /// Labels of the rules that fired, in order.
    pub matched_rules: Vec<&'a str>,
}

/// Outcome for a whole frame.
#[derive(Debug, Clone)]
pub struct FrameRectification {
    /// Bytes to send: the rebuilt envelope if anything changed, otherwise the frame as received.
    pub bytes: Bytes,
    pub rectified: bool,
    pub reply_to_sender: bool,
    pub matched_rules: Vec<String>,
}

impl FrameRectification {
    /// Rectified frames asking for it go back to their sender.
    pub fn send_back(&self) -> bool {
        self.rectified && self.reply_to_sender
    }
}

#[derive(Debug, Clone, Default)]
pub struct Rectifier {
    table: RuleTable,
}

impl Rectifier {
    pub fn new(table: RuleTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &RuleTable {
        &self.table
    }

    pub fn rectify<'a>(&'a self, body: &'a [u8]) -> Rectification<'a> {
        let mut buffer = body;
        let mut rectified = false;
        let mut reply_to_sender = false;
        let mut matched_rules = Vec::new();

        for rule in self.table.iter() {
            if rule.matches(buffer) {
                buffer = &rule.replacement;
                rectified = true;
                reply_to_sender |= rule.reply_to_sender;
                matched_rules.push(rule.label.as_str());
                debug!("rectify [{}]: rectified", rule.label);
            } else {
                debug!("rectify [{}]: not rectified", rule.label);
            }
        }

        Rectification {
            body: buffer,
            rectified,
            reply_to_sender,
            matched_rules,
        }
    }

    /// Rectify every operation body record of `frame` and re-envelope the result under the
    /// original message id. Fails if a replaced record is not one well-formed BER record.
    pub fn rectify_frame(&self, frame: &Frame) -> Result<FrameRectification, FrameError> {
        let mut children: Vec<&[u8]> = Vec::with_capacity(frame.body_len());
        let mut rectified = false;
        let mut reply_to_sender = false;
        let mut matched_rules = Vec::new();

        for (i, child) in frame.operation_body().enumerate() {
            let result = self.rectify(child);
            if result.rectified {
                validate_single_record(result.body).map_err(|e| {
                    FrameError::MalformedContent(format!(
                        "rule {} produced an invalid record: {}",
                        result.matched_rules.last().copied().unwrap_or("?"),
                        e
                    ))
                })?;
            }
            rectified |= result.rectified;
            reply_to_sender |= result.reply_to_sender;
            debug!(
                "Rectifier [{}] {}: rectified: {} sendback: {}",
                i,
                record_name(child[0]),
                rectified,
                reply_to_sender
            );
            matched_rules.extend(result.matched_rules.iter().map(|l| l.to_string()));
            children.push(result.body);
        }

        let bytes = if rectified {
            Bytes::from(frame.rebuild(children))
        } else {
            frame.raw().clone()
        };

        Ok(FrameRectification {
            bytes,
            rectified,
            reply_to_sender,
            matched_rules,
        })
    }
}
