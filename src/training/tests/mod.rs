//! End-to-end tests of the training loop controller with a recording
//! strategy and an in-memory batch source

mod support;

mod loop_tests;
mod resume_tests;
