//! Parser for preprocessed JSON item logs
//!
//! The `filter` subcommand writes one serialized item per line; this parser
//! reads that format back, which is the fast path for repeated replays of
//! the same capture (no log tokenization, no pending-execute tracking).

use std::io::{BufRead, BufReader, Read};

use super::{spawn_parser, ParserHandle};

/// Parse a newline-delimited JSON item log.
pub fn parse_json<R>(input: R) -> ParserHandle
where
    R: Read + Send + 'static,
{
    spawn_parser(move |sink| {
        let reader = BufReader::new(input);

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }

            let keep_going = match serde_json::from_str(&line) {
                Ok(item) => sink.emit(Ok(Some(item))),
                Err(err) => {
                    sink.report(err.into());
                    true
                }
            };
            if !keep_going {
                break;
            }
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;
    use std::io::Cursor;

    async fn collect(input: String) -> (Vec<Item>, usize) {
        let mut handle = parse_json(Cursor::new(input));
        let mut items = Vec::new();
        while let Some(item) = handle.items.recv().await {
            items.push(item);
        }

        let mut error_count = 0;
        while handle.errors.try_recv().is_ok() {
            error_count += 1;
        }

        assert!(handle.done.await.unwrap().is_ok());
        (items, error_count)
    }

    #[tokio::test]
    async fn round_trips_an_errlog_capture() {
        // Parse a stderr log, re-encode the items as JSON lines, and feed
        // them back through this parser: both passes must agree.
        let errlog = "\
2019-02-25 15:08:27.222 GMT|alice|playback_test|5c7404eb.d6bd|LOG:  connection authorized: user=alice database=playback_test
2019-02-25 15:08:27.222 GMT|alice|playback_test|5c7404eb.d6bd|LOG:  statement: select now()
2019-02-25 15:08:27.222 GMT|alice|playback_test|5c7404eb.d6bd|LOG:  execute <unnamed>: insert into logs values ($1)
2019-02-25 15:08:27.222 GMT|alice|playback_test|5c7404eb.d6bd|DETAIL:  parameters: $1 = 'it''s'
2019-02-25 15:08:27.222 GMT|alice|playback_test|5c7404eb.d6bd|LOG:  disconnection: session time: 0:00:03.861 user=alice database=playback_test host=[local]
";
        let mut first_pass = Vec::new();
        let mut handle = crate::parse::parse_errlog(Cursor::new(errlog.to_string()));
        while let Some(item) = handle.items.recv().await {
            first_pass.push(item);
        }
        assert_eq!(first_pass.len(), 4);

        let encoded = first_pass
            .iter()
            .map(|item| serde_json::to_string(item).unwrap())
            .collect::<Vec<_>>()
            .join("\n");

        let (second_pass, errors) = collect(encoded).await;
        assert_eq!(errors, 0);
        assert_eq!(second_pass, first_pass);
    }

    #[tokio::test]
    async fn bad_lines_are_diagnostics_not_fatal() {
        let good = r#"{"type":"Connect","item":{"timestamp":"2019-02-25T15:08:27.222Z","session_id":"5c7404eb.d6bd","user":"alice","database":"playback_test"}}"#;
        let input = format!("not json at all\n{good}\n{{\"type\":\"Mystery\",\"item\":{{}}}}\n");

        let (items, errors) = collect(input).await;
        assert_eq!(items.len(), 1);
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let good = r#"{"type":"Connect","item":{"timestamp":"2019-02-25T15:08:27.222Z","session_id":"5c7404eb.d6bd","user":"alice","database":"playback_test"}}"#;
        let (items, errors) = collect(format!("\n{good}\n\n")).await;
        assert_eq!(items.len(), 1);
        assert_eq!(errors, 0);
    }
}
