// Spytrace - Line-level execution tracer
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Instrumentation macros.
//!
//! Variable lists are comma separated. A plain name binds a `Serialize + Debug`
//! value; a name prefixed with `?` binds a value that is only `Debug`, which is
//! always captured through the fallback.

/// Build [`Bindings`](crate::Bindings) from a list of local variables.
///
/// `bindings!(a, b, ?socket)`
#[macro_export]
macro_rules! bindings {
    (@bind $b:ident;) => {};
    (@bind $b:ident; ? $name:ident $(, $($rest:tt)*)?) => {
        $b.bind_opaque(stringify!($name), &$name);
        $crate::bindings!(@bind $b; $($($rest)*)?);
    };
    (@bind $b:ident; $name:ident $(, $($rest:tt)*)?) => {
        $b.bind(stringify!($name), &$name);
        $crate::bindings!(@bind $b; $($($rest)*)?);
    };

    () => {
        $crate::Bindings::new()
    };
    ($($vars:tt)+) => {{
        let mut bindings = $crate::Bindings::new();
        $crate::bindings!(@bind bindings; $($vars)+);
        bindings
    }};
}

/// Enter an instrumented function, returning its [`Frame`](crate::Frame).
///
/// `trace_call!("name"; arg1, arg2)`, or with a globals provider,
/// `trace_call!("name", globals = provider; arg1)`.
#[macro_export]
macro_rules! trace_call {
    ($function:expr, globals = $globals:expr $(; $($args:tt)*)?) => {
        $crate::Frame::enter_with_globals(
            $function,
            Some($globals as $crate::GlobalsFn),
            $crate::Site::new(file!(), line!()),
            &$crate::bindings!($($($args)*)?),
        )
    };
    ($function:expr $(; $($args:tt)*)?) => {
        $crate::Frame::enter(
            $function,
            $crate::Site::new(file!(), line!()),
            &$crate::bindings!($($($args)*)?),
        )
    };
}

/// Report that the statement on this line is about to execute.
///
/// `trace_line!(frame; a, b)`
#[macro_export]
macro_rules! trace_line {
    ($frame:expr $(; $($locals:tt)*)?) => {
        $frame.line($crate::Site::new(file!(), line!()), &$crate::bindings!($($($locals)*)?))
    };
}

/// Report the function's return value.
///
/// `trace_return!(frame, value; a, b)`
#[macro_export]
macro_rules! trace_return {
    ($frame:expr, $value:expr $(; $($locals:tt)*)?) => {
        $frame.ret(
            $crate::Site::new(file!(), line!()),
            &$value,
            &$crate::bindings!($($($locals)*)?),
        )
    };
}

/// Report an error raised in the function.
///
/// `trace_exception!(frame, err; a)`
#[macro_export]
macro_rules! trace_exception {
    ($frame:expr, $error:expr $(; $($locals:tt)*)?) => {
        $frame.raise(
            $crate::Site::new(file!(), line!()),
            &$error,
            &$crate::bindings!($($($locals)*)?),
        )
    };
}
