// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for development tools and the test suite.  These
//! should not be used in production code.

use slog::o;
use slog::Drain;
use slog::Logger;

/// Return a [`slog::Logger`] suitable for a test named `test_name`.
///
/// Output goes to the terminal so that failing tests show the controller's
/// log interleaved with assertions.
pub fn test_setup_log(test_name: &str) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("test" => test_name.to_owned()))
}

/// Return a root logger that discards everything, for benchmarks and tests
/// that do not care about output.
pub fn null_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
