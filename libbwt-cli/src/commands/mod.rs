pub mod check;
pub mod ping;
pub mod run;
