#[cfg(test)]
mod mocks;

#[cfg(test)]
mod consume_service_tests;
