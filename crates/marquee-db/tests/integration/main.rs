mod common;
mod retry_repository_tests;
mod scheduler_tests;
