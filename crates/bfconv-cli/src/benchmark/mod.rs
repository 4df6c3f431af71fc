pub mod problem;
pub mod run;
