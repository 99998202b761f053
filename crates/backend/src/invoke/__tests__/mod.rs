mod direct;
mod worker;
