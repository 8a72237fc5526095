// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use log::{error, info, warn};

/// Receives the runner's user-visible diagnostics.
///
/// The runner owns no logging configuration; everything user-visible flows
/// through a sink supplied by the caller, so hosts decide where lines go and
/// tests can capture them.
pub trait CoverageSink {
    fn info(&mut self, message: &str);
    fn warning(&mut self, message: &str);
    fn error(&mut self, message: &str);
}

/// Forwards diagnostics to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl CoverageSink for LogSink {
    fn info(&mut self, message: &str) {
        info!("{}", message);
    }

    fn warning(&mut self, message: &str) {
        warn!("{}", message);
    }

    fn error(&mut self, message: &str) {
        error!("{}", message);
    }
}
