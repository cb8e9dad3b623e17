//! Behavioural scenarios exercising a link and handler together.
