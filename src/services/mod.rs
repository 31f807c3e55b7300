pub mod metrics;
pub mod migrator;
pub mod provisioner;
pub mod seeder;
pub mod tenancy;
