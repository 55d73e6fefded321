pub mod build_job_repo;

pub use build_job_repo::BuildJobRepo;
