mod declaration_test;
mod events_test;
mod external_test;
mod properties_test;
