// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

macro_rules! log_on_failure {
    ($op:expr, $fmt:tt $(, $arg:expr)*) => {{
        let result = $op;
        if let Err(ref e) = result {
            warn!(
                concat!($fmt, "; failed with error: {}"),
                $($arg,)*
                e
            );
        }
        result?
    }}
}

/// Wrap the error of a fallible expression with a formatted message,
/// producing a `GuardError::Chained`.
macro_rules! chain_err {
    ($op:expr, $fmt:tt $(, $arg:expr)*) => {
        $op.map_err(|e| {
            $crate::guard::GuardError::Chained(format!($fmt $(, $arg)*), Box::new(e))
        })
    };
}
