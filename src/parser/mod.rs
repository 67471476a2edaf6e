//! Response Parser: pure, total function from analyzer reply text to
//! `(observations, summary)`.
//!
//! The analyzer emits free text interleaved with tagged JSON records, one
//! per line, in the same line-delimited shape `agents/protocol.rs` uses for
//! its own frames (`{"record": "...", ...}`). Anything that isn't a
//! recognized tagged line — prose, a code fence, a line that merely looks
//! like JSON — is ignored. A malformed record under a recognized tag is
//! skipped rather than aborting the whole parse, since one bad line must
//! never cost the rest of the reply.

use crate::model::{ObservationPayload, SummaryPayload};
use serde::Deserialize;

#[derive(Deserialize)]
struct Tagged {
    record: String,
}

/// Parses one analyzer reply into the observations and optional summary it
/// contains. Never errors: unrecognized input yields `(vec![], None)`.
pub fn parse_reply(text: &str) -> (Vec<ObservationPayload>, Option<SummaryPayload>) {
    let mut observations = Vec::new();
    let mut summary = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || !line.starts_with('{') {
            continue;
        }
        let Ok(tagged) = serde_json::from_str::<Tagged>(line) else {
            continue;
        };
        match tagged.record.as_str() {
            "observation" => {
                if let Ok(payload) = serde_json::from_str::<ObservationPayload>(line) {
                    observations.push(payload);
                }
            }
            "summary" => {
                if let Ok(payload) = serde_json::from_str::<SummaryPayload>(line) {
                    summary = Some(payload);
                }
            }
            _ => {}
        }
    }

    (observations, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_prose_and_parses_tagged_lines() {
        let text = concat!(
            "I looked at the file and noticed a few things.\n",
            "{\"record\":\"observation\",\"type\":\"code\",\"title\":\"t\",\"subtitle\":\"\",",
            "\"narrative\":\"\",\"text\":\"\",\"facts\":[],\"concepts\":[],\"files_read\":[],\"files_modified\":[]}\n",
            "Some trailing commentary.\n",
        );
        let (obs, summary) = parse_reply(text);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].title, "t");
        assert!(summary.is_none());
    }

    #[test]
    fn skips_malformed_record_but_keeps_parsing() {
        let text = concat!(
            "{\"record\":\"observation\",\"type\":\"code\"}\n", // missing required fields, parses via defaults since all are String/Vec
            "{\"record\":\"observation\", this is not json\n",
            "{\"record\":\"summary\",\"request\":\"r\"}\n",
        );
        let (obs, summary) = parse_reply(text);
        assert_eq!(obs.len(), 1);
        assert!(summary.is_some());
        assert_eq!(summary.unwrap().request.as_deref(), Some("r"));
    }

    #[test]
    fn empty_input_is_total() {
        assert_eq!(parse_reply(""), (vec![], None));
        assert_eq!(parse_reply("no json here at all"), (vec![], None));
    }
}
