pub mod predictor_tests;
