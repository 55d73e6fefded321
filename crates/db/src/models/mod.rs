pub mod build_job;
