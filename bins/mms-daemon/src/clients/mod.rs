pub mod mmsc_http;
