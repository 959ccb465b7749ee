use std::io::{self, Write};

use crate::trace::reply::Reply;

/// Writes one CSV line per reply to a byte sink.
///
/// Every line is the reply's field list followed by the round tag and a
/// literal `1`. The sink is buffered by the caller and must be flushed
/// before the capture thread exits so no lines are lost.
pub struct ReplyCsvWriter<W: Write> {
    writer: W,
    round: String,
}

impl<W: Write> ReplyCsvWriter<W> {
    pub fn new(writer: W, round: impl Into<String>) -> Self {
        Self {
            writer,
            round: round.into(),
        }
    }

    pub fn write(&mut self, reply: &Reply) -> io::Result<()> {
        writeln!(self.writer, "{},{},1", reply.to_csv(), self.round)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
