//! Per-chunk analysis: prompt, call, parse. No storage writes.

use crate::analyzer::{AnalyzerError, TextAnalyzer, ERROR_SENTINEL};
use crate::chunking::Chunk;
use crate::result::AnalysisResult;
use crate::schema::OutputSchema;

/// What happened to one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    Analyzed(AnalysisResult),
    /// Contributes nothing; the chunk's ids stay unprocessed and are retried next run.
    Skipped { reason: String },
}

impl ChunkOutcome {
    pub fn is_analyzed(&self) -> bool {
        matches!(self, ChunkOutcome::Analyzed(_))
    }
}

pub struct ChunkProcessor<'a> {
    analyzer: &'a dyn TextAnalyzer,
    schema: OutputSchema,
}

impl<'a> ChunkProcessor<'a> {
    pub fn new(analyzer: &'a dyn TextAnalyzer, schema: OutputSchema) -> Self {
        Self { analyzer, schema }
    }

    pub fn schema(&self) -> OutputSchema {
        self.schema
    }

    /// Analyze one chunk. Only a fatal analyzer error is returned as `Err`.
    pub fn process(&self, chunk: &Chunk<'_>) -> Result<ChunkOutcome, AnalyzerError> {
        if chunk.is_empty() {
            return Ok(ChunkOutcome::Analyzed(AnalysisResult::empty(self.schema)));
        }
        let reply = match self.analyzer.analyze(self.schema.instruction(), &chunk.prompt_body()) {
            Ok(reply) => reply,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return Ok(ChunkOutcome::Skipped { reason: e.to_string() }),
        };
        if reply.trim() == ERROR_SENTINEL {
            return Ok(ChunkOutcome::Skipped { reason: "analyzer reported an error".into() });
        }
        match self.schema.parse_response(&reply) {
            Ok(result) => Ok(ChunkOutcome::Analyzed(result)),
            Err(e) => Ok(ChunkOutcome::Skipped { reason: e.to_string() }),
        }
    }
}
