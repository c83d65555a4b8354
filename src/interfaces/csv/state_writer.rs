use crate::domain::payment::PaymentId;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

/// One observed flow state, as written to the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceRow {
    pub step: usize,
    pub state: String,
    pub payment_id: Option<PaymentId>,
    pub detail: String,
}

/// Writes state traces as CSV with a `step,state,payment_id,detail` header.
pub struct StateWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> StateWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_rows<'a, I>(&mut self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a TraceRow>,
    {
        for row in rows {
            self.writer.serialize(row)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
