// Copyright 2025 the Gantry authors. MIT license.

/// Schedules a plain `Error` on the isolate.
pub fn throw_error(scope: &mut v8::PinScope, message: impl AsRef<str>) {
  let message = v8::String::new(scope, message.as_ref()).unwrap();
  let exception = v8::Exception::error(scope, message);
  scope.throw_exception(exception);
}

/// Schedules a `TypeError` on the isolate.
pub fn throw_type_error(scope: &mut v8::PinScope, message: impl AsRef<str>) {
  let message = v8::String::new(scope, message.as_ref()).unwrap();
  let exception = v8::Exception::type_error(scope, message);
  scope.throw_exception(exception);
}
